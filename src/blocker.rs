//! Token-bucketed matching of compiled network filters.
//!
//! Filters are grouped into buckets keyed by the hash of their most
//! selective token; at match time only the buckets whose token occurs in
//! the request URL are probed, so the cost scales with the number of
//! distinct URL tokens rather than the number of compiled filters. Within
//! a bucket, eligible plain patterns are folded into a packed trie after
//! `optimize`.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::filters::network::{
    FilterPattern, ModifierKind, NetworkFilter, NetworkFilterMask,
};
use crate::request::Request;
use crate::strie::{TrieContainer, TrieRef};
use crate::utils::{bin_lookup, fast_hash, Hash};

// Tokens too common to discriminate anything; avoided as bucket keys when
// the filter offers an alternative.
static BAD_TOKENS: Lazy<Vec<Hash>> = Lazy::new(|| {
    let mut hashes: Vec<Hash> = [
        "com", "http", "https", "icon", "images", "img", "js", "net", "news", "www",
    ]
    .iter()
    .map(|t| fast_hash(t))
    .collect();
    hashes.sort_unstable();
    hashes
});

fn best_token(tokens: &[(Hash, usize)]) -> Option<(Hash, usize)> {
    tokens
        .iter()
        .copied()
        .find(|(hash, _)| !bin_lookup(&BAD_TOKENS, *hash))
        .or_else(|| tokens.first().copied())
}

/// Outcome of matching one request. The numeric values are part of the
/// contract with external callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Verdict {
    NoMatch = 0,
    Block = 1,
    Allow = 2,
}

/// Diagnostic description of the filter that decided a verdict.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockerLogData {
    /// The filter's raw text when compiled in debug mode, otherwise a
    /// reconstruction from the compiled record.
    pub filter: String,
}

/// One resolved modifier directive, e.g. a CSP fragment to inject.
#[derive(Debug, Clone, PartialEq)]
pub struct ModifierDirective {
    pub value: String,
    pub filter: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct FilterBucket {
    filters: Vec<NetworkFilter>,
    trie: Option<TrieRef>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct NetworkFilterList {
    filter_map: HashMap<Hash, FilterBucket>,
    trie_container: TrieContainer,
    // patterns folded into bucket tries, for filter recovery
    trie_filters: HashMap<String, NetworkFilter>,
}

impl NetworkFilterList {
    pub fn new(filters: Vec<NetworkFilter>) -> NetworkFilterList {
        let mut list = NetworkFilterList::default();
        for mut filter in filters {
            // First token that is not a known overly-common one; filters
            // with no extractable token at all land in the reserved
            // zero-hash bucket, scanned for every request.
            let best = best_token(&filter.get_tokens());
            filter.token = best;
            let key = best.map(|(hash, _)| hash).unwrap_or(0);
            list.filter_map.entry(key).or_default().filters.push(filter);
        }
        list
    }

    pub fn filter_count(&self) -> usize {
        self.filter_map.values().map(|b| b.filters.len()).sum::<usize>()
            + self.trie_filters.len()
    }

    /// Fold eligible plain filters of each bucket into a packed trie. A
    /// filter is eligible when a trie hit alone proves a match: plain
    /// pattern, token at pattern offset zero, and no option narrowing the
    /// default mask.
    pub fn optimize(&mut self) {
        for bucket in self.filter_map.values_mut() {
            if !bucket.filters.iter().any(trieable) {
                continue;
            }
            let mut kept = Vec::with_capacity(bucket.filters.len());
            let mut trie = bucket
                .trie
                .unwrap_or_else(|| self.trie_container.create_one());
            for filter in bucket.filters.drain(..) {
                if trieable(&filter) {
                    if let FilterPattern::Plain(pattern) = &filter.pattern {
                        self.trie_container.add(&mut trie, pattern);
                        self.trie_filters.insert(pattern.clone(), filter);
                    }
                } else {
                    kept.push(filter);
                }
            }
            bucket.filters = kept;
            bucket.trie = Some(trie);
        }
        self.trie_container.optimize();
    }

    /// The first matching filter for this request, probing one bucket per
    /// URL token.
    pub fn check(&self, request: &Request) -> Option<&NetworkFilter> {
        if self.filter_map.is_empty() {
            return None;
        }
        for token in request.get_tokens() {
            if let Some(bucket) = self.filter_map.get(&token.hash) {
                for filter in &bucket.filters {
                    if filter.matches(request, token.beg) {
                        return Some(filter);
                    }
                }
                if let Some(trie) = &bucket.trie {
                    let end = self
                        .trie_container
                        .matches(trie, request.url.as_bytes(), token.beg);
                    if end >= 0 {
                        let pattern = &request.url[token.beg..end as usize];
                        if let Some(filter) = self.trie_filters.get(pattern) {
                            return Some(filter);
                        }
                    }
                }
            }
        }
        None
    }

    /// All matching filters, for modifier resolution.
    pub fn check_all<'a>(&'a self, request: &Request, found: &mut Vec<&'a NetworkFilter>) {
        if self.filter_map.is_empty() {
            return;
        }
        for token in request.get_tokens() {
            if let Some(bucket) = self.filter_map.get(&token.hash) {
                for filter in &bucket.filters {
                    if filter.matches(request, token.beg) {
                        found.push(filter);
                    }
                }
            }
        }
    }
}

fn trieable(filter: &NetworkFilter) -> bool {
    filter.mask == NetworkFilterMask::DEFAULT_OPTIONS
        && filter.modifier.is_none()
        && matches!(filter.token, Some((hash, 0)) if hash != 0)
        && matches!(&filter.pattern, FilterPattern::Plain(p) if !p.is_empty())
}

/// The compiled rule set, partitioned by realm so the evaluation order of
/// [`Blocker::check`] is a handful of bucket probes per realm.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Blocker {
    pub(crate) importants: NetworkFilterList,
    pub(crate) exceptions: NetworkFilterList,
    pub(crate) filters: NetworkFilterList,
    pub(crate) modifiers: NetworkFilterList,
}

impl Blocker {
    pub fn new(network_filters: Vec<NetworkFilter>) -> Blocker {
        let mut importants = Vec::new();
        let mut exceptions = Vec::new();
        let mut filters = Vec::new();
        let mut modifiers = Vec::new();

        for filter in network_filters {
            if filter.modifier.is_some() {
                modifiers.push(filter);
            } else if filter.is_exception() {
                exceptions.push(filter);
            } else if filter.is_important() {
                importants.push(filter);
            } else {
                filters.push(filter);
            }
        }

        Blocker {
            importants: NetworkFilterList::new(importants),
            exceptions: NetworkFilterList::new(exceptions),
            filters: NetworkFilterList::new(filters),
            modifiers: NetworkFilterList::new(modifiers),
        }
    }

    pub fn optimize(&mut self) {
        self.importants.optimize();
        self.exceptions.optimize();
        self.filters.optimize();
        self.modifiers.optimize();
    }

    pub fn filter_count(&self) -> usize {
        self.importants.filter_count()
            + self.exceptions.filter_count()
            + self.filters.filter_count()
            + self.modifiers.filter_count()
    }

    /// Resolve a single verdict: an important block filter wins
    /// unconditionally; otherwise an exception overrides a block;
    /// otherwise a block filter blocks; otherwise no match. Exceptions
    /// are only consulted once a block filter has matched.
    pub fn check(&self, request: &Request) -> Verdict {
        self.check_with_log_data(request).0
    }

    /// Like [`Blocker::check`], also reporting which filter decided the
    /// verdict.
    pub fn check_with_log_data(&self, request: &Request) -> (Verdict, Option<BlockerLogData>) {
        if let Some(filter) = self.importants.check(request) {
            return (
                Verdict::Block,
                Some(BlockerLogData {
                    filter: filter.to_string(),
                }),
            );
        }
        if let Some(filter) = self.filters.check(request) {
            if let Some(exception) = self.exceptions.check(request) {
                return (
                    Verdict::Allow,
                    Some(BlockerLogData {
                        filter: exception.to_string(),
                    }),
                );
            }
            return (
                Verdict::Block,
                Some(BlockerLogData {
                    filter: filter.to_string(),
                }),
            );
        }
        (Verdict::NoMatch, None)
    }

    /// Resolve modifier directives of one kind, independently of the
    /// verdict. An exception with an empty value cancels every directive
    /// of the kind; an exception with a value cancels the equal value.
    /// `None` when nothing remains.
    pub fn get_modifiers(
        &self,
        request: &Request,
        kind: ModifierKind,
    ) -> Option<Vec<ModifierDirective>> {
        let mut matched: Vec<&NetworkFilter> = Vec::new();
        self.modifiers.check_all(request, &mut matched);
        matched.retain(|f| f.modifier.as_ref().map(|m| m.kind) == Some(kind));
        if matched.is_empty() {
            return None;
        }

        let (exceptions, directives): (Vec<_>, Vec<_>) =
            matched.into_iter().partition(|f| f.is_exception());

        let mut cancelled_all = false;
        let mut cancelled_values: Vec<&str> = Vec::new();
        for exception in &exceptions {
            match exception.modifier.as_ref() {
                Some(m) if m.value.is_empty() => cancelled_all = true,
                Some(m) => cancelled_values.push(&m.value),
                None => {}
            }
        }
        if cancelled_all {
            return None;
        }

        let directives: Vec<ModifierDirective> = directives
            .into_iter()
            .filter_map(|f| {
                let value = f.modifier.as_ref().map(|m| m.value.clone())?;
                if cancelled_values.iter().any(|v| *v == value) {
                    return None;
                }
                Some(ModifierDirective {
                    value,
                    filter: f.to_string(),
                })
            })
            .collect();

        if directives.is_empty() {
            None
        } else {
            Some(directives)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lists::parse_filters;
    use crate::psl::PublicSuffixList;

    fn psl() -> PublicSuffixList {
        PublicSuffixList::parse("com\nnet\norg\ntest\n")
    }

    fn blocker(lines: &[&str]) -> Blocker {
        let parsed = parse_filters(lines.iter().copied(), true);
        assert!(parsed.errors.is_empty(), "{:?}", parsed.errors);
        Blocker::new(parsed.filters)
    }

    fn request(url: &str, source: &str, cpt: &str) -> Request {
        Request::new(url, source, cpt, &psl()).unwrap()
    }

    #[test]
    fn blocks_and_misses() {
        let blocker = blocker(&["||ads.example.com^"]);
        assert_eq!(
            blocker.check(&request(
                "https://ads.example.com/banner.js",
                "https://site.test",
                "script"
            )),
            Verdict::Block
        );
        assert_eq!(
            blocker.check(&request(
                "https://ads.example.net/banner.js",
                "https://site.test",
                "script"
            )),
            Verdict::NoMatch
        );
    }

    #[test]
    fn exception_overrides_block() {
        let blocker = blocker(&["||ads.example.com^", "@@||ads.example.com/allowed.js"]);
        assert_eq!(
            blocker.check(&request(
                "https://ads.example.com/allowed.js",
                "https://site.test",
                "script"
            )),
            Verdict::Allow
        );
        assert_eq!(
            blocker.check(&request(
                "https://ads.example.com/banner.js",
                "https://site.test",
                "script"
            )),
            Verdict::Block
        );
    }

    #[test]
    fn important_beats_exception() {
        let blocker = blocker(&[
            "||ads.example.com^$important",
            "@@||ads.example.com/allowed.js",
        ]);
        assert_eq!(
            blocker.check(&request(
                "https://ads.example.com/allowed.js",
                "https://site.test",
                "script"
            )),
            Verdict::Block
        );
    }

    #[test]
    fn exception_without_block_is_no_match() {
        let blocker = blocker(&["@@||ads.example.com^"]);
        assert_eq!(
            blocker.check(&request(
                "https://ads.example.com/banner.js",
                "https://site.test",
                "script"
            )),
            Verdict::NoMatch
        );
    }

    #[test]
    fn log_data_reports_the_deciding_filter() {
        let blocker = blocker(&["||ads.example.com^", "@@||ads.example.com/allowed.js"]);
        let (verdict, log) = blocker.check_with_log_data(&request(
            "https://ads.example.com/allowed.js",
            "https://site.test",
            "script",
        ));
        assert_eq!(verdict, Verdict::Allow);
        assert_eq!(log.unwrap().filter, "@@||ads.example.com/allowed.js");

        let (verdict, log) = blocker.check_with_log_data(&request(
            "https://other.test/page",
            "https://site.test",
            "other",
        ));
        assert_eq!(verdict, Verdict::NoMatch);
        assert!(log.is_none());
    }

    #[test]
    fn plain_patterns_match_through_buckets() {
        let blocker = blocker(&["banner-rotation/"]);
        assert_eq!(
            blocker.check(&request(
                "https://example.com/banner-rotation/x.gif",
                "https://example.com",
                "image"
            )),
            Verdict::Block
        );
        assert_eq!(
            blocker.check(&request(
                "https://example.com/rotation/x.gif",
                "https://example.com",
                "image"
            )),
            Verdict::NoMatch
        );
    }

    #[test]
    fn optimize_folds_plain_filters_and_keeps_behavior() {
        let mut blocker = blocker(&["adframe/zones", "adframe/banners", "adframe/track$image"]);
        let hit = |b: &Blocker, url: &str, cpt: &str| {
            b.check(&request(url, "https://example.com", cpt))
        };

        let before = [
            hit(&blocker, "https://x.com/adframe/zones?id=1", "script"),
            hit(&blocker, "https://x.com/adframe/banners", "image"),
            hit(&blocker, "https://x.com/adframe/track", "image"),
            hit(&blocker, "https://x.com/adframe/track", "script"),
            hit(&blocker, "https://x.com/adframe/other", "script"),
        ];
        assert_eq!(
            before,
            [
                Verdict::Block,
                Verdict::Block,
                Verdict::Block,
                Verdict::NoMatch,
                Verdict::NoMatch
            ]
        );

        blocker.optimize();
        // the two unrestricted plain filters are folded into the trie
        assert!(blocker.filters.trie_filters.len() == 2);

        let after = [
            hit(&blocker, "https://x.com/adframe/zones?id=1", "script"),
            hit(&blocker, "https://x.com/adframe/banners", "image"),
            hit(&blocker, "https://x.com/adframe/track", "image"),
            hit(&blocker, "https://x.com/adframe/track", "script"),
            hit(&blocker, "https://x.com/adframe/other", "script"),
        ];
        assert_eq!(before, after);
    }

    #[test]
    fn right_anchored_filter_matches_mid_run() {
        // the URL run "mypixel" continues to the left of the pattern's
        // leading run; the bucket key must come from the anchored end
        let blocker = blocker(&["pixel.gif|"]);
        assert_eq!(
            blocker.check(&request(
                "https://cdn.test/mypixel.gif",
                "https://site.test",
                "image"
            )),
            Verdict::Block
        );
        assert_eq!(
            blocker.check(&request(
                "https://cdn.test/mypixel.gift",
                "https://site.test",
                "image"
            )),
            Verdict::NoMatch
        );
    }

    #[test]
    fn partial_trailing_run_is_not_a_bucket_key() {
        // "ban" continues to the right in the URL; the complete run "js"
        // must key the bucket even though it is a common token
        let blocker = blocker(&["/js/ban"]);
        assert_eq!(
            blocker.check(&request(
                "https://cdn.test/js/banner.gif",
                "https://site.test",
                "script"
            )),
            Verdict::Block
        );
        assert_eq!(
            blocker.check(&request(
                "https://cdn.test/js/other.gif",
                "https://site.test",
                "script"
            )),
            Verdict::NoMatch
        );
    }

    #[test]
    fn no_token_filters_live_in_the_fallback_bucket() {
        // single-character runs produce no token at all
        let blocker = blocker(&["-p-"]);
        assert_eq!(
            blocker.check(&request(
                "https://example.com/x-p-y.gif",
                "https://example.com",
                "image"
            )),
            Verdict::Block
        );
        assert_eq!(
            blocker.check(&request(
                "https://example.com/xpy.gif",
                "https://example.com",
                "image"
            )),
            Verdict::NoMatch
        );
    }

    #[test]
    fn csp_modifiers_are_collected() {
        let blocker = blocker(&[
            "||example.com^$csp=script-src 'none'",
            "||example.com^$csp=worker-src 'none'",
        ]);
        let req = request("https://example.com/page", "https://example.com", "other");
        let directives = blocker.get_modifiers(&req, ModifierKind::Csp).unwrap();
        let mut values: Vec<String> = directives.into_iter().map(|d| d.value).collect();
        values.sort();
        assert_eq!(values, ["script-src 'none'", "worker-src 'none'"]);

        assert!(blocker.get_modifiers(&req, ModifierKind::Removeparam).is_none());
    }

    #[test]
    fn valued_exception_cancels_equal_value() {
        let blocker = blocker(&[
            "||example.com^$csp=script-src 'none'",
            "||example.com^$csp=worker-src 'none'",
            "@@||example.com^$csp=worker-src 'none'",
        ]);
        let req = request("https://example.com/page", "https://example.com", "other");
        let directives = blocker.get_modifiers(&req, ModifierKind::Csp).unwrap();
        assert_eq!(directives.len(), 1);
        assert_eq!(directives[0].value, "script-src 'none'");
    }

    #[test]
    fn empty_exception_cancels_all() {
        let blocker = blocker(&[
            "||example.com^$csp=script-src 'none'",
            "@@||example.com^$csp",
        ]);
        let req = request("https://example.com/page", "https://example.com", "other");
        assert!(blocker.get_modifiers(&req, ModifierKind::Csp).is_none());
    }

    #[test]
    fn modifiers_do_not_affect_the_verdict() {
        let blocker = blocker(&["||example.com^$csp=script-src 'none'"]);
        assert_eq!(
            blocker.check(&request(
                "https://example.com/page",
                "https://example.com",
                "other"
            )),
            Verdict::NoMatch
        );
    }

    #[test]
    fn serialized_blocker_matches_identically() {
        let mut blocker = blocker(&[
            "||ads.example.com^",
            "@@||ads.example.com/allowed.js",
            "adframe/zones",
            "adframe/banners",
        ]);
        blocker.optimize();

        let blob = rmp_serde::to_vec(&blocker).unwrap();
        let restored: Blocker = rmp_serde::from_slice(&blob).unwrap();

        for (url, cpt) in [
            ("https://ads.example.com/banner.js", "script"),
            ("https://ads.example.com/allowed.js", "script"),
            ("https://x.com/adframe/zones", "script"),
            ("https://x.com/unrelated", "script"),
        ] {
            let req = request(url, "https://site.test", cpt);
            assert_eq!(restored.check(&req), blocker.check(&req));
        }
    }
}
