//! Public Suffix List matcher: answers "is X a public suffix" and "what is
//! the registrable domain of hostname H".
//!
//! Loaded once from the suffix-list text format found at
//! <https://publicsuffix.org/list/>. Lookup walks the hostname label by
//! label from the right through a tree whose per-node child arrays are kept
//! sorted for binary search; an exception rule (`!city.kawasaki.jp`) forces
//! the suffix boundary one label earlier, a wildcard rule (`*.kawasaki.jp`)
//! matches any single label.

use std::borrow::Cow;
use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

const FLAG_SUFFIX: u8 = 0b01;
const FLAG_EXCEPTION: u8 = 0b10;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Node {
    label: String,
    flags: u8,
    // child node indices, sorted by label (length first, then bytes)
    children: Vec<u32>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublicSuffixList {
    nodes: Vec<Node>,
}

// Shortest label first, so `*` always sorts in front of its siblings.
fn compare_labels(a: &str, b: &str) -> Ordering {
    a.len().cmp(&b.len()).then_with(|| a.as_bytes().cmp(b.as_bytes()))
}

struct Boundary {
    // label index, counted from the rightmost label, where the public
    // suffix starts
    cursor: Option<usize>,
    // a wildcard rule was involved somewhere along the walk
    wildcard: bool,
}

impl Default for PublicSuffixList {
    fn default() -> Self {
        PublicSuffixList {
            nodes: vec![Node { label: String::new(), flags: 0, children: Vec::new() }],
        }
    }
}

impl PublicSuffixList {
    /// Parse the publicsuffix.org list format: `//` comments, `!` exception
    /// rules, `*.` wildcard rules. Lines that cannot be normalized to ASCII
    /// are dropped.
    pub fn parse(text: &str) -> PublicSuffixList {
        let mut psl = PublicSuffixList::default();

        // If no rule matches, the prevailing rule is "*".
        psl.add_rule("*", false);

        for raw_line in text.lines() {
            let mut line = raw_line;
            if let Some(pos) = line.find("//") {
                line = &line[..pos];
            }
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (line, exception) = match line.strip_prefix('!') {
                Some(rest) => (rest, true),
                None => (line, false),
            };
            let lowered = line.to_lowercase();
            if lowered.bytes().any(|b| !matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'.' | b'-' | b'*')) {
                match idna::domain_to_ascii(&lowered) {
                    Ok(ascii) => psl.add_rule(&ascii, exception),
                    Err(_) => continue,
                }
            } else {
                psl.add_rule(&lowered, exception);
            }
        }
        psl
    }

    fn add_rule(&mut self, rule: &str, exception: bool) {
        let mut inode = 0usize;
        for label in rule.rsplit('.') {
            if label.is_empty() {
                continue;
            }
            inode = self.child_or_insert(inode, label);
        }
        self.nodes[inode].flags |= FLAG_SUFFIX;
        if exception {
            self.nodes[inode].flags |= FLAG_EXCEPTION;
        }
    }

    fn child_or_insert(&mut self, inode: usize, label: &str) -> usize {
        let pos = self.nodes[inode]
            .children
            .binary_search_by(|&c| compare_labels(&self.nodes[c as usize].label, label));
        match pos {
            Ok(i) => self.nodes[inode].children[i] as usize,
            Err(i) => {
                let child = self.nodes.len();
                self.nodes.push(Node {
                    label: label.to_string(),
                    flags: 0,
                    children: Vec::new(),
                });
                self.nodes[inode].children.insert(i, child as u32);
                child
            }
        }
    }

    fn find_child(&self, inode: usize, label: &str) -> Option<usize> {
        self.nodes[inode]
            .children
            .binary_search_by(|&c| compare_labels(&self.nodes[c as usize].label, label))
            .ok()
            .map(|i| self.nodes[inode].children[i] as usize)
    }

    /// Walk the hostname right to left, returning where the public suffix
    /// begins, in labels counted from the right.
    fn suffix_boundary(&self, hostname: &str, spans: &[(usize, usize)]) -> Boundary {
        let mut inode = 0usize;
        let mut cursor = None;
        let mut wildcard = false;

        for (i, &(beg, end)) in spans.iter().enumerate() {
            let label = &hostname[beg..end];
            if self.nodes[inode].children.is_empty() {
                break;
            }
            let found = match self.find_child(inode, label) {
                Some(c) => Some(c),
                None => {
                    let w = self.find_child(inode, "*");
                    if w.is_some() {
                        wildcard = true;
                    }
                    w
                }
            };
            let Some(child) = found else { break };
            inode = child;
            let flags = self.nodes[inode].flags;
            if flags & FLAG_EXCEPTION != 0 {
                // The prevailing exception rule is modified by removing its
                // leftmost label.
                if i > 0 {
                    return Boundary { cursor: Some(i - 1), wildcard };
                }
                break;
            }
            if flags & FLAG_SUFFIX != 0 {
                cursor = Some(i);
            }
        }

        Boundary { cursor, wildcard }
    }

    /// The public suffix of `hostname`, or `""` when none applies. The
    /// returned slice keeps the caller's casing.
    pub fn get_public_suffix<'a>(&self, hostname: &'a str) -> &'a str {
        let lowered = match normalized(hostname) {
            Some(h) => h,
            None => return "",
        };
        // ASCII lowering preserves byte offsets, so spans computed on the
        // lowered copy index directly into the caller's string.
        let spans = label_spans(&lowered);
        match self.suffix_boundary(&lowered, &spans).cursor {
            Some(cursor) => &hostname[spans[cursor].0..],
            None => "",
        }
    }

    /// The registrable domain of `hostname`: its public suffix plus one
    /// label. `""` when the hostname is itself a suffix, or unknown.
    pub fn get_domain<'a>(&self, hostname: &'a str) -> Cow<'a, str> {
        let hostname = match normalized(hostname) {
            Some(h) => h,
            None => return Cow::Borrowed(""),
        };
        let spans = label_spans(&hostname);
        let boundary = self.suffix_boundary(&hostname, &spans);
        let Some(cursor) = boundary.cursor else {
            return Cow::Borrowed("");
        };
        if cursor + 1 >= spans.len() {
            // The whole hostname is a public suffix.
            return Cow::Borrowed("");
        }
        let beg = spans[cursor + 1].0;
        match hostname {
            Cow::Borrowed(h) => Cow::Borrowed(&h[beg..]),
            Cow::Owned(h) => Cow::Owned(h[beg..].to_string()),
        }
    }

    /// Whether the whole of `hostname` is a public suffix, per an explicit
    /// (non-wildcard) rule.
    pub fn suffix_in_psl(&self, hostname: &str) -> bool {
        let hostname = match normalized(hostname) {
            Some(h) => h,
            None => return false,
        };
        let spans = label_spans(&hostname);
        let boundary = self.suffix_boundary(&hostname, &spans);
        boundary.cursor == Some(spans.len() - 1) && !boundary.wildcard
    }
}

fn normalized(hostname: &str) -> Option<Cow<'_, str>> {
    if hostname.is_empty() || hostname.starts_with('.') {
        return None;
    }
    if hostname.bytes().any(|b| b.is_ascii_uppercase()) {
        Some(Cow::Owned(hostname.to_ascii_lowercase()))
    } else {
        Some(Cow::Borrowed(hostname))
    }
}

/// Byte spans of the hostname's labels, rightmost first.
fn label_spans(hostname: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::with_capacity(8);
    let mut end = hostname.len();
    loop {
        match hostname[..end].rfind('.') {
            Some(dot) => {
                spans.push((dot + 1, end));
                end = dot;
            }
            None => {
                spans.push((0, end));
                break;
            }
        }
    }
    spans
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIST: &str = "\
// ===BEGIN ICANN DOMAINS===
com
net
org
io
uk
co.uk
jp
*.kawasaki.jp
!city.kawasaki.jp
";

    fn psl() -> PublicSuffixList {
        PublicSuffixList::parse(LIST)
    }

    #[test]
    fn simple_suffixes() {
        let psl = psl();
        assert_eq!(psl.get_public_suffix("example.com"), "com");
        assert_eq!(psl.get_domain("example.com").as_ref(), "example.com");
        assert_eq!(psl.get_domain("a.b.example.com").as_ref(), "example.com");
        assert_eq!(psl.get_domain("sub.example.co.uk").as_ref(), "example.co.uk");
        assert_eq!(psl.get_public_suffix("sub.example.co.uk"), "co.uk");
    }

    #[test]
    fn bare_suffix_has_no_domain() {
        let psl = psl();
        assert_eq!(psl.get_domain("com").as_ref(), "");
        assert_eq!(psl.get_domain("co.uk").as_ref(), "");
    }

    #[test]
    fn unknown_tld_prevails_as_star() {
        let psl = psl();
        // prevailing rule "*": the TLD itself is the suffix
        assert_eq!(psl.get_domain("a.localhost").as_ref(), "a.localhost");
        assert_eq!(psl.get_domain("localhost").as_ref(), "");
    }

    #[test]
    fn wildcard_rule() {
        let psl = psl();
        assert_eq!(psl.get_public_suffix("web.kawasaki.jp"), "web.kawasaki.jp");
        assert_eq!(psl.get_domain("web.kawasaki.jp").as_ref(), "");
        assert_eq!(psl.get_domain("a.web.kawasaki.jp").as_ref(), "a.web.kawasaki.jp");
    }

    #[test]
    fn exception_rule() {
        let psl = psl();
        assert_eq!(psl.get_public_suffix("city.kawasaki.jp"), "kawasaki.jp");
        assert_eq!(psl.get_domain("city.kawasaki.jp").as_ref(), "city.kawasaki.jp");
        assert_eq!(psl.get_domain("a.city.kawasaki.jp").as_ref(), "city.kawasaki.jp");
    }

    #[test]
    fn suffix_membership() {
        let psl = psl();
        assert!(psl.suffix_in_psl("co.uk"));
        assert!(psl.suffix_in_psl("com"));
        assert!(!psl.suffix_in_psl("example.com"));
        // wildcard matches are not explicit membership
        assert!(!psl.suffix_in_psl("web.kawasaki.jp"));
    }

    #[test]
    fn degenerate_hostnames() {
        let psl = psl();
        assert_eq!(psl.get_domain("").as_ref(), "");
        assert_eq!(psl.get_domain(".example.com").as_ref(), "");
    }

    #[test]
    fn uppercase_input_is_normalized() {
        let psl = psl();
        assert_eq!(psl.get_domain("A.B.Example.COM").as_ref(), "example.com");
        // the suffix slice keeps the caller's casing
        assert_eq!(psl.get_public_suffix("Example.COM"), "COM");
        assert_eq!(psl.get_public_suffix("Sub.Example.Co.UK"), "Co.UK");
    }

    #[test]
    fn selfie_roundtrip() {
        let psl = psl();
        let blob = rmp_serde::to_vec(&psl).unwrap();
        let restored: PublicSuffixList = rmp_serde::from_slice(&blob).unwrap();
        assert_eq!(restored.get_domain("a.b.example.co.uk").as_ref(), "example.co.uk");
        assert!(restored.suffix_in_psl("co.uk"));
    }
}
