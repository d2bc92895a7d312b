//! Line-oriented parsing of filter-list text into compiled filters,
//! collecting per-line diagnostics instead of aborting.

use itertools::{Either, Itertools};

use crate::filters::network::{NetworkFilter, NetworkFilterError};

#[derive(Debug, PartialEq)]
pub enum FilterType {
    Network,
    Hosts,
    Comment,
    NotSupported,
}

/// One skipped line, kept for diagnostics; parsing always continues.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterParseEvent {
    /// 1-based line number within the parsed text.
    pub line_number: usize,
    pub filter: String,
    pub error: NetworkFilterError,
}

#[derive(Debug, Default)]
pub struct ParsedFilterList {
    pub filters: Vec<NetworkFilter>,
    pub errors: Vec<FilterParseEvent>,
}

/// Parse a whole list. Comments and unsupported syntaxes are skipped
/// silently; lines that look like network filters but fail to compile are
/// recorded as error events.
pub fn parse_filters(
    list: impl IntoIterator<Item = impl AsRef<str>>,
    debug: bool,
) -> ParsedFilterList {
    let (filters, errors): (Vec<_>, Vec<_>) = list
        .into_iter()
        .enumerate()
        .filter_map(|(i, line)| {
            let filter = line.as_ref().trim();
            let parsed = match detect_filter_type(filter) {
                FilterType::Network => NetworkFilter::parse(filter, debug),
                FilterType::Hosts => {
                    let hostname = filter.split_whitespace().last().unwrap_or("");
                    if is_self_referencing_host(hostname) {
                        return None;
                    }
                    NetworkFilter::parse_hosts_style(hostname, debug)
                }
                FilterType::Comment | FilterType::NotSupported => return None,
            };
            Some(match parsed {
                Ok(f) => Either::Left(f),
                Err(error) => Either::Right(FilterParseEvent {
                    line_number: i + 1,
                    filter: filter.to_string(),
                    error,
                }),
            })
        })
        .partition_map(|entry| entry);

    ParsedFilterList { filters, errors }
}

/// Given a single line, decide which specific parser applies before
/// creating a [`NetworkFilter`].
fn detect_filter_type(filter: &str) -> FilterType {
    if filter.is_empty() || filter.len() == 1 {
        return FilterType::Comment;
    }
    if filter.starts_with('!') || filter.starts_with('[') || filter.starts_with('#') {
        return FilterType::Comment;
    }

    if filter.starts_with('|') || filter.starts_with("@@") {
        return FilterType::Network;
    }

    // Adguard extended syntaxes and cosmetic rules are out of scope here.
    if filter.contains("$$") || filter.contains("##") || filter.contains("#@#") {
        return FilterType::NotSupported;
    }

    // Hosts-file shapes: "0.0.0.0 hostname", "127.0.0.1 hostname", or a
    // bare hostname with no filter syntax at all.
    let mut fields = filter.split_whitespace();
    match (fields.next(), fields.next(), fields.next()) {
        (Some(addr), Some(host), None)
            if matches!(addr, "0.0.0.0" | "127.0.0.1" | "::1" | "::" | "0")
                && is_plain_hostname(host) =>
        {
            return FilterType::Hosts;
        }
        (Some(host), None, None) if is_plain_hostname(host) && host.contains('.') => {
            return FilterType::Hosts;
        }
        _ => {}
    }

    // Everything else is a network filter
    FilterType::Network
}

fn is_plain_hostname(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_alphanumeric() || c == '.' || c == '-' || c == '_')
}

// Entries hosts files carry for the local machine itself.
fn is_self_referencing_host(hostname: &str) -> bool {
    matches!(
        hostname,
        "localhost"
            | "localhost.localdomain"
            | "local"
            | "broadcasthost"
            | "ip6-localhost"
            | "ip6-loopback"
            | "ip6-localnet"
            | "ip6-mcastprefix"
            | "ip6-allnodes"
            | "ip6-allrouters"
            | "ip6-allhosts"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::network::FilterPattern;

    #[test]
    fn classifies_lines() {
        assert_eq!(detect_filter_type("! a comment"), FilterType::Comment);
        assert_eq!(detect_filter_type("[Adblock Plus 2.0]"), FilterType::Comment);
        assert_eq!(detect_filter_type("# hosts comment"), FilterType::Comment);
        assert_eq!(detect_filter_type("||ads.example.com^"), FilterType::Network);
        assert_eq!(detect_filter_type("@@||example.com^"), FilterType::Network);
        assert_eq!(detect_filter_type("0.0.0.0 tracker.example.com"), FilterType::Hosts);
        assert_eq!(detect_filter_type("tracker.example.com"), FilterType::Hosts);
        assert_eq!(detect_filter_type("example.com##.ad"), FilterType::NotSupported);
        assert_eq!(detect_filter_type("/banner$image"), FilterType::Network);
    }

    #[test]
    fn parses_mixed_list() {
        let list = [
            "! comment",
            "||ads.example.com^",
            "0.0.0.0 tracker.example.com",
            "127.0.0.1 localhost",
            "@@||ads.example.com/allowed.js",
            "/^bad regex$/",
            "",
        ];
        let parsed = parse_filters(list, true);
        assert_eq!(parsed.filters.len(), 3);
        assert_eq!(parsed.errors.len(), 1);
        assert_eq!(parsed.errors[0].line_number, 6);
        assert_eq!(
            parsed.errors[0].error,
            NetworkFilterError::FullRegexUnsupported
        );
    }

    #[test]
    fn hosts_lines_become_hostname_rules() {
        let parsed = parse_filters(["0.0.0.0 ads.tracker.net"], false);
        assert_eq!(parsed.filters.len(), 1);
        assert_eq!(
            parsed.filters[0].pattern,
            FilterPattern::Hostname("ads.tracker.net".to_string())
        );
    }
}
