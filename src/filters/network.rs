//! Filters that take effect at the network request level: blocking,
//! exceptions, and response-modifier directives.

use memchr::{memchr as find_char, memmem};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::fmt;

use crate::request::{Request, RequestType};
use crate::utils::{self, Hash};

/// For now, only support `$removeparam` with simple alphanumeric/dash/underscore patterns.
static VALID_PARAM: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_\-]+$").unwrap());

static INVALID_HOSTNAME_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new("[/^*!?$&(){}\\[\\]+=~`\\s|@,'\"><:;]").unwrap());

#[derive(Debug, Error, PartialEq, Clone)]
pub enum NetworkFilterError {
    #[error("failed to parse filter")]
    FilterParseError,
    #[error("empty pattern")]
    EmptyPattern,
    #[error("negated important")]
    NegatedImportant,
    #[error("full regex unsupported")]
    FullRegexUnsupported,
    #[error("wildcard patterns unsupported")]
    WildcardUnsupported,
    #[error("empty csp")]
    EmptyCsp,
    #[error("empty redirection")]
    EmptyRedirection,
    #[error("empty removeparam")]
    EmptyRemoveparam,
    #[error("removeparam regex unsupported")]
    RemoveparamRegexUnsupported,
    #[error("multiple modifier options")]
    MultipleModifierOptions,
    #[error("unrecognised option")]
    UnrecognisedOption,
    #[error("punycode error")]
    PunycodeError,
    #[error("invalid hostname")]
    InvalidHostname,
}

bitflags::bitflags! {
    #[derive(Serialize, Deserialize)]
    pub struct NetworkFilterMask: u32 {
        const FROM_IMAGE = 1; // 1 << 0;
        const FROM_MEDIA = 1 << 1;
        const FROM_OTHER = 1 << 2;
        const FROM_PING = 1 << 3;
        const FROM_SCRIPT = 1 << 4;
        const FROM_STYLESHEET = 1 << 5;
        const FROM_SUBDOCUMENT = 1 << 6;
        const FROM_WEBSOCKET = 1 << 7;
        const FROM_XMLHTTPREQUEST = 1 << 8;
        const FROM_FONT = 1 << 9;
        const THIRD_PARTY = 1 << 10;
        const FIRST_PARTY = 1 << 11;
        const IS_IMPORTANT = 1 << 12;
        const IS_EXCEPTION = 1 << 13;

        // Kind of pattern
        const IS_LEFT_ANCHOR = 1 << 14;
        const IS_RIGHT_ANCHOR = 1 << 15;
        const IS_HOSTNAME_ANCHOR = 1 << 16;

        const FROM_NETWORK_TYPES = Self::FROM_FONT.bits |
            Self::FROM_IMAGE.bits |
            Self::FROM_MEDIA.bits |
            Self::FROM_OTHER.bits |
            Self::FROM_PING.bits |
            Self::FROM_SCRIPT.bits |
            Self::FROM_STYLESHEET.bits |
            Self::FROM_SUBDOCUMENT.bits |
            Self::FROM_WEBSOCKET.bits |
            Self::FROM_XMLHTTPREQUEST.bits;

        // Unless the filter specifies otherwise, all these options are set by default
        const DEFAULT_OPTIONS = Self::FROM_NETWORK_TYPES.bits |
            Self::THIRD_PARTY.bits |
            Self::FIRST_PARTY.bits;

        // Careful with checking for NONE - will always match
        const NONE = 0;
    }
}

impl fmt::Display for NetworkFilterMask {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:b}", &self)
    }
}

impl From<RequestType> for NetworkFilterMask {
    fn from(request_type: RequestType) -> NetworkFilterMask {
        match request_type {
            RequestType::Stylesheet => NetworkFilterMask::FROM_STYLESHEET,
            RequestType::Script => NetworkFilterMask::FROM_SCRIPT,
            RequestType::Image => NetworkFilterMask::FROM_IMAGE,
            RequestType::Subdocument => NetworkFilterMask::FROM_SUBDOCUMENT,
            RequestType::Xmlhttprequest => NetworkFilterMask::FROM_XMLHTTPREQUEST,
            RequestType::Websocket => NetworkFilterMask::FROM_WEBSOCKET,
            RequestType::Ping => NetworkFilterMask::FROM_PING,
            RequestType::Font => NetworkFilterMask::FROM_FONT,
            RequestType::Media => NetworkFilterMask::FROM_MEDIA,
            RequestType::Other => NetworkFilterMask::FROM_OTHER,
        }
    }
}

/// Pattern for a network filter, discriminated by anchoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FilterPattern {
    /// Bare hostname rule: matches any URL on that host or a subdomain.
    Hostname(String),
    /// Unanchored substring of the URL.
    Plain(String),
    /// `|`-anchored: the URL starts with the pattern.
    LeftAnchored(String),
    /// Trailing `|`: the URL ends with the pattern.
    RightAnchored(String),
    /// `||`-anchored: hostname suffix match plus a pattern over the rest of
    /// the URL.
    HostnameAnchored { hostname: String, pattern: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModifierKind {
    Csp,
    RedirectRule,
    Removeparam,
}

/// A secondary directive attached to a filter, resolved independently of
/// the block/allow verdict. An empty value on an exception filter cancels
/// every directive of the same kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterModifier {
    pub kind: ModifierKind,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkFilter {
    pub mask: NetworkFilterMask,
    pub pattern: FilterPattern,
    pub modifier: Option<FilterModifier>,

    /// Populated only in debug mode.
    pub raw_line: Option<Box<String>>,

    // Bucket key and its byte offset within the pattern, selected when the
    // owning list is built.
    pub(crate) token: Option<(Hash, usize)>,
}

impl NetworkFilter {
    /// Parse one filter-list line.
    pub fn parse(raw_filter: &str, debug: bool) -> Result<NetworkFilter, NetworkFilterError> {
        let mut filter = raw_filter.trim();
        let mut mask = NetworkFilterMask::DEFAULT_OPTIONS;

        if let Some(stripped) = filter.strip_prefix("@@") {
            filter = stripped;
            mask |= NetworkFilterMask::IS_EXCEPTION;
        }

        if filter.len() > 1 && filter.starts_with('/') && filter.ends_with('/') {
            return Err(NetworkFilterError::FullRegexUnsupported);
        }

        let mut modifier: Option<FilterModifier> = None;
        let is_exception = mask.contains(NetworkFilterMask::IS_EXCEPTION);

        // Options live after the last '$'.
        if let Some(dollar) = filter.rfind('$') {
            let (pattern_part, options_part) = filter.split_at(dollar);
            parse_options(&options_part[1..], &mut mask, &mut modifier, is_exception)?;
            filter = pattern_part;
        }

        if let Some(stripped) = filter.strip_prefix("||") {
            filter = stripped;
            mask |= NetworkFilterMask::IS_HOSTNAME_ANCHOR;
        } else if let Some(stripped) = filter.strip_prefix('|') {
            filter = stripped;
            mask |= NetworkFilterMask::IS_LEFT_ANCHOR;
        }

        if filter.len() > 1 {
            if let Some(stripped) = filter.strip_suffix('|') {
                filter = stripped;
                mask |= NetworkFilterMask::IS_RIGHT_ANCHOR;
            }
        }

        // A single trailing '^' is only a separator for what follows the
        // pattern; dropping it widens the filter slightly.
        if let Some(stripped) = filter.strip_suffix('^') {
            filter = stripped;
        }

        if find_char(b'*', filter.as_bytes()).is_some() {
            return Err(NetworkFilterError::WildcardUnsupported);
        }
        if find_char(b'^', filter.as_bytes()).is_some() {
            return Err(NetworkFilterError::FilterParseError);
        }

        let filter = filter.to_ascii_lowercase();

        let pattern = if mask.contains(NetworkFilterMask::IS_HOSTNAME_ANCHOR) {
            let slash = find_char(b'/', filter.as_bytes());
            let (hostname, rest) = match slash {
                Some(pos) => filter.split_at(pos),
                None => (filter.as_str(), ""),
            };
            let hostname = normalize_hostname(hostname)?;
            if rest.is_empty() {
                mask -= NetworkFilterMask::IS_RIGHT_ANCHOR;
                FilterPattern::Hostname(hostname)
            } else {
                FilterPattern::HostnameAnchored {
                    hostname,
                    pattern: rest.to_string(),
                }
            }
        } else if filter.is_empty() {
            // Pattern-less filters match every URL; only meaningful when
            // they carry a modifier or stand as a broad exception.
            if modifier.is_none() && !mask.contains(NetworkFilterMask::IS_EXCEPTION) {
                return Err(NetworkFilterError::EmptyPattern);
            }
            mask -= NetworkFilterMask::IS_LEFT_ANCHOR | NetworkFilterMask::IS_RIGHT_ANCHOR;
            FilterPattern::Plain(String::new())
        } else if mask.contains(NetworkFilterMask::IS_LEFT_ANCHOR) {
            FilterPattern::LeftAnchored(filter)
        } else if mask.contains(NetworkFilterMask::IS_RIGHT_ANCHOR) {
            FilterPattern::RightAnchored(filter)
        } else {
            FilterPattern::Plain(filter)
        };

        Ok(NetworkFilter {
            mask,
            pattern,
            modifier,
            raw_line: if debug {
                Some(Box::new(raw_filter.to_string()))
            } else {
                None
            },
            token: None,
        })
    }

    /// Compile a hosts-file style line (a bare hostname) into an any-party,
    /// any-type block rule.
    pub fn parse_hosts_style(hostname: &str, debug: bool) -> Result<NetworkFilter, NetworkFilterError> {
        let hostname = normalize_hostname(&hostname.trim().to_ascii_lowercase())?;
        if !hostname.contains('.') {
            return Err(NetworkFilterError::InvalidHostname);
        }
        let raw_line = if debug {
            Some(Box::new(hostname_raw_line(&hostname)))
        } else {
            None
        };
        Ok(NetworkFilter {
            mask: NetworkFilterMask::DEFAULT_OPTIONS | NetworkFilterMask::IS_HOSTNAME_ANCHOR,
            pattern: FilterPattern::Hostname(hostname),
            modifier: None,
            raw_line,
            token: None,
        })
    }

    pub fn is_exception(&self) -> bool {
        self.mask.contains(NetworkFilterMask::IS_EXCEPTION)
    }

    pub fn is_important(&self) -> bool {
        self.mask.contains(NetworkFilterMask::IS_IMPORTANT)
    }

    /// Candidate bucket tokens with their byte offsets in the matchable
    /// pattern. A leading or trailing run that is not pinned by an anchor
    /// may be a fragment of a longer URL run, so it is skipped; a bucket
    /// key must always surface as a complete token of a matching URL.
    pub fn get_tokens(&self) -> Vec<(Hash, usize)> {
        match &self.pattern {
            // Hostname matches are label-bounded on both sides.
            FilterPattern::Hostname(hostname) => utils::tokenize_filter(hostname, false, false),
            FilterPattern::HostnameAnchored { hostname, pattern } => {
                let skip_last = !self.mask.contains(NetworkFilterMask::IS_RIGHT_ANCHOR);
                let tokens = utils::tokenize_filter(pattern, false, skip_last);
                if tokens.is_empty() {
                    utils::tokenize_filter(hostname, false, false)
                } else {
                    tokens
                }
            }
            FilterPattern::Plain(pattern) | FilterPattern::LeftAnchored(pattern) => {
                utils::tokenize_filter(pattern, false, true)
            }
            FilterPattern::RightAnchored(pattern) => {
                utils::tokenize_filter(pattern, true, false)
            }
        }
    }

    /// Whether the filter matches the request, given the URL byte offset of
    /// the token that selected this filter's bucket.
    pub fn matches(&self, request: &Request, token_beg: usize) -> bool {
        self.check_options(request) && self.check_pattern(request, token_beg)
    }

    fn check_options(&self, request: &Request) -> bool {
        if !self.mask.contains(request.request_type.into()) {
            return false;
        }
        if request.is_third_party && !self.mask.contains(NetworkFilterMask::THIRD_PARTY) {
            return false;
        }
        if !request.is_third_party && !self.mask.contains(NetworkFilterMask::FIRST_PARTY) {
            return false;
        }
        true
    }

    fn check_pattern(&self, request: &Request, token_beg: usize) -> bool {
        match &self.pattern {
            FilterPattern::Hostname(hostname) => hostname_matches(hostname, &request.hostname),
            FilterPattern::HostnameAnchored { hostname, pattern } => {
                if !hostname_matches(hostname, &request.hostname) {
                    return false;
                }
                let Some(beg) = request.url.find(&request.hostname) else {
                    return false;
                };
                let rest = &request.url[beg + request.hostname.len()..];
                if self.mask.contains(NetworkFilterMask::IS_RIGHT_ANCHOR) {
                    rest == pattern
                } else {
                    rest.starts_with(pattern.as_str())
                }
            }
            FilterPattern::LeftAnchored(pattern) => request.url.starts_with(pattern.as_str()),
            FilterPattern::RightAnchored(pattern) => request.url.ends_with(pattern.as_str()),
            FilterPattern::Plain(pattern) => match self.token {
                Some((hash, pattern_beg)) if hash != 0 => {
                    // Byte-wise: the candidate offset may fall inside a
                    // multibyte character of the URL.
                    match token_beg.checked_sub(pattern_beg) {
                        Some(beg) => request.url.as_bytes()[beg..].starts_with(pattern.as_bytes()),
                        None => false,
                    }
                }
                _ => memmem::find(request.url.as_bytes(), pattern.as_bytes()).is_some(),
            },
        }
    }
}

impl fmt::Display for NetworkFilter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.raw_line {
            Some(raw) => write!(f, "{}", raw),
            None => {
                if self.is_exception() {
                    write!(f, "@@")?;
                }
                match &self.pattern {
                    FilterPattern::Hostname(h) => write!(f, "||{}^", h),
                    FilterPattern::HostnameAnchored { hostname, pattern } => {
                        write!(f, "||{}{}", hostname, pattern)
                    }
                    FilterPattern::LeftAnchored(p) => write!(f, "|{}", p),
                    FilterPattern::RightAnchored(p) => write!(f, "{}|", p),
                    FilterPattern::Plain(p) => write!(f, "{}", p),
                }
            }
        }
    }
}

fn hostname_raw_line(hostname: &str) -> String {
    let mut raw = String::with_capacity(hostname.len() + 3);
    raw.push_str("||");
    raw.push_str(hostname);
    raw.push('^');
    raw
}

/// Boundary-safe hostname suffix match: `example.com` covers
/// `sub.example.com` but not `notanexample.com`.
fn hostname_matches(filter_hostname: &str, request_hostname: &str) -> bool {
    if !request_hostname.ends_with(filter_hostname) {
        return false;
    }
    let boundary = request_hostname.len() - filter_hostname.len();
    boundary == 0 || request_hostname.as_bytes()[boundary - 1] == b'.'
}

fn normalize_hostname(hostname: &str) -> Result<String, NetworkFilterError> {
    if hostname.is_empty() {
        return Err(NetworkFilterError::InvalidHostname);
    }
    if INVALID_HOSTNAME_CHARS.is_match(hostname) {
        return Err(NetworkFilterError::InvalidHostname);
    }
    if hostname.is_ascii() {
        Ok(hostname.to_string())
    } else {
        idna::domain_to_ascii(hostname).map_err(|_| NetworkFilterError::PunycodeError)
    }
}

fn parse_options(
    options: &str,
    mask: &mut NetworkFilterMask,
    modifier: &mut Option<FilterModifier>,
    is_exception: bool,
) -> Result<(), NetworkFilterError> {
    let mut positive_types = NetworkFilterMask::NONE;
    let mut negative_types = NetworkFilterMask::NONE;

    for option in options.split(',') {
        let (negated, option) = match option.strip_prefix('~') {
            Some(rest) => (true, rest),
            None => (false, option),
        };
        let (name, value) = match find_char(b'=', option.as_bytes()) {
            Some(pos) => (&option[..pos], &option[pos + 1..]),
            None => (option, ""),
        };

        match name {
            "important" => {
                if negated {
                    return Err(NetworkFilterError::NegatedImportant);
                }
                *mask |= NetworkFilterMask::IS_IMPORTANT;
            }
            "first-party" | "1p" => {
                if negated {
                    *mask -= NetworkFilterMask::FIRST_PARTY;
                } else {
                    *mask -= NetworkFilterMask::THIRD_PARTY;
                }
            }
            "third-party" | "3p" => {
                if negated {
                    *mask -= NetworkFilterMask::THIRD_PARTY;
                } else {
                    *mask -= NetworkFilterMask::FIRST_PARTY;
                }
            }
            "csp" => {
                set_modifier(modifier, ModifierKind::Csp, value)?;
                if value.is_empty() && !is_exception {
                    return Err(NetworkFilterError::EmptyCsp);
                }
            }
            "redirect-rule" => {
                set_modifier(modifier, ModifierKind::RedirectRule, value)?;
                if value.is_empty() && !is_exception {
                    return Err(NetworkFilterError::EmptyRedirection);
                }
            }
            "removeparam" => {
                set_modifier(modifier, ModifierKind::Removeparam, value)?;
                if value.is_empty() {
                    if !is_exception {
                        return Err(NetworkFilterError::EmptyRemoveparam);
                    }
                } else if !VALID_PARAM.is_match(value) {
                    return Err(NetworkFilterError::RemoveparamRegexUnsupported);
                }
            }
            _ => {
                let type_bit = match name {
                    "stylesheet" | "css" => NetworkFilterMask::FROM_STYLESHEET,
                    "script" => NetworkFilterMask::FROM_SCRIPT,
                    "image" => NetworkFilterMask::FROM_IMAGE,
                    "subdocument" | "frame" => NetworkFilterMask::FROM_SUBDOCUMENT,
                    "xmlhttprequest" | "xhr" => NetworkFilterMask::FROM_XMLHTTPREQUEST,
                    "websocket" => NetworkFilterMask::FROM_WEBSOCKET,
                    "ping" | "beacon" => NetworkFilterMask::FROM_PING,
                    "font" => NetworkFilterMask::FROM_FONT,
                    "media" => NetworkFilterMask::FROM_MEDIA,
                    "other" => NetworkFilterMask::FROM_OTHER,
                    _ => return Err(NetworkFilterError::UnrecognisedOption),
                };
                if negated {
                    negative_types |= type_bit;
                } else {
                    positive_types |= type_bit;
                }
            }
        }
    }

    if positive_types != NetworkFilterMask::NONE {
        *mask -= NetworkFilterMask::FROM_NETWORK_TYPES;
        *mask |= positive_types;
    }
    *mask -= negative_types;

    Ok(())
}

fn set_modifier(
    modifier: &mut Option<FilterModifier>,
    kind: ModifierKind,
    value: &str,
) -> Result<(), NetworkFilterError> {
    if modifier.is_some() {
        return Err(NetworkFilterError::MultipleModifierOptions);
    }
    *modifier = Some(FilterModifier {
        kind,
        value: value.to_string(),
    });
    Ok(())
}
