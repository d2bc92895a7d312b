//! Per-site dynamic override matrix: user-entered
//! `source destination type action` rules that can force-block or
//! force-allow a request independently of the compiled filter lists.
//!
//! Cells are sparse: one `u32` per `(source, destination)` pair holds a
//! 2-bit action field per supported type, and zero-valued cells are
//! deleted rather than stored.

use std::collections::HashMap;
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::psl::PublicSuffixList;
use crate::url_parser::{self, hostname_chain};

static BAD_HOSTNAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^0-9a-z_.\[\]:-]").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Action {
    Unset = 0,
    Block = 1,
    Allow = 2,
    Noop = 3,
}

impl Action {
    fn from_bits(bits: u32) -> Action {
        match bits & 3 {
            1 => Action::Block,
            2 => Action::Allow,
            3 => Action::Noop,
            _ => Action::Unset,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Action::Unset => "unset",
            Action::Block => "block",
            Action::Allow => "allow",
            Action::Noop => "noop",
        }
    }

    fn from_name(name: &str) -> Option<Action> {
        match name {
            "block" => Some(Action::Block),
            "allow" => Some(Action::Allow),
            "noop" => Some(Action::Noop),
            _ => None,
        }
    }
}

/// One 2-bit field per supported type within a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellType {
    Any,
    InlineScript,
    FirstPartyScript,
    ThirdPartyScript,
    ThirdPartyFrame,
    Image,
    Script,
    SubFrame,
}

impl CellType {
    const ALL: [CellType; 8] = [
        CellType::Any,
        CellType::InlineScript,
        CellType::FirstPartyScript,
        CellType::ThirdPartyScript,
        CellType::ThirdPartyFrame,
        CellType::Image,
        CellType::Script,
        CellType::SubFrame,
    ];

    fn bit_offset(self) -> u32 {
        match self {
            CellType::Any => 0,
            CellType::InlineScript => 2,
            CellType::FirstPartyScript => 4,
            CellType::ThirdPartyScript => 6,
            CellType::ThirdPartyFrame => 8,
            CellType::Image => 10,
            CellType::Script => 12,
            CellType::SubFrame => 14,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CellType::Any => "*",
            CellType::InlineScript => "inline-script",
            CellType::FirstPartyScript => "1p-script",
            CellType::ThirdPartyScript => "3p-script",
            CellType::ThirdPartyFrame => "3p-frame",
            CellType::Image => "image",
            CellType::Script => "script",
            CellType::SubFrame => "sub_frame",
        }
    }

    pub fn from_name(name: &str) -> Option<CellType> {
        match name {
            "*" => Some(CellType::Any),
            "inline-script" => Some(CellType::InlineScript),
            "1p-script" => Some(CellType::FirstPartyScript),
            "3p-script" => Some(CellType::ThirdPartyScript),
            "3p-frame" => Some(CellType::ThirdPartyFrame),
            "image" => Some(CellType::Image),
            "script" => Some(CellType::Script),
            "sub_frame" | "subdocument" => Some(CellType::SubFrame),
            _ => None,
        }
    }
}

impl fmt::Display for CellType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// The outcome of one matrix evaluation: the action, plus the broadened
/// coordinates of the cell that decided it, for rule-string reconstruction.
#[derive(Debug, Clone, PartialEq)]
pub struct FirewallResult {
    pub action: Action,
    /// The (possibly broadened) source hostname that matched.
    pub source: String,
    /// The (possibly broadened) destination hostname that matched.
    pub destination: String,
    /// The cell type that matched, `None` when nothing did.
    pub cell_type: Option<CellType>,
}

impl FirewallResult {
    fn unset() -> FirewallResult {
        FirewallResult {
            action: Action::Unset,
            source: String::new(),
            destination: String::new(),
            cell_type: None,
        }
    }

    pub fn must_block(&self) -> bool {
        self.action == Action::Block
    }

    pub fn must_allow(&self) -> bool {
        self.action == Action::Allow
    }

    pub fn must_block_or_allow(&self) -> bool {
        self.must_block() || self.must_allow()
    }

    /// Noop rules abort further (static-filter) evaluation without forcing
    /// a verdict.
    pub fn must_abort(&self) -> bool {
        self.action == Action::Noop
    }

    /// The matched rule in `source destination type action` form, or `""`.
    pub fn to_rule_string(&self) -> String {
        match self.cell_type {
            Some(cell_type) if self.action != Action::Unset => format!(
                "{} {} {} {}",
                self.source,
                self.destination,
                cell_type,
                self.action.name()
            ),
            _ => String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Firewall {
    // keyed by "srcHostname desHostname"
    rules: HashMap<String, u32>,
}

fn rule_key(src: &str, des: &str) -> String {
    let mut key = String::with_capacity(src.len() + des.len() + 1);
    key.push_str(src);
    key.push(' ');
    key.push_str(des);
    key
}

fn is_3rd_party(src: &str, des: &str, psl: &PublicSuffixList) -> bool {
    // A party-less relation cannot be labelled third-party.
    if des == "*" || src == "*" || src.is_empty() {
        return false;
    }
    let src_domain = url_parser::domain_from_hostname(src, psl);
    !url_parser::is_first_party(&src_domain, des)
}

impl Firewall {
    pub fn new() -> Firewall {
        Firewall::default()
    }

    pub fn reset(&mut self) {
        self.rules.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Replace this rule set wholesale with `other`'s.
    pub fn assign(&mut self, other: &Firewall) {
        self.rules = other.rules.clone();
    }

    /// Write one cell. Returns false when the write changes nothing. A cell
    /// whose fields are all unset is deleted.
    pub fn set_cell(&mut self, src: &str, des: &str, cell_type: CellType, action: Action) -> bool {
        let offset = cell_type.bit_offset();
        let key = rule_key(src, des);
        let old_bitmap = self.rules.get(&key).copied().unwrap_or(0);
        let new_bitmap = old_bitmap & !(3 << offset) | ((action as u32) << offset);
        if new_bitmap == old_bitmap {
            return false;
        }
        if new_bitmap == 0 {
            self.rules.remove(&key);
        } else {
            self.rules.insert(key, new_bitmap);
        }
        true
    }

    /// Clear the given cell if some rule currently decides this
    /// coordinate. Returns false when evaluation was already unset.
    pub fn unset_cell(
        &mut self,
        src: &str,
        des: &str,
        cell_type: CellType,
        psl: &PublicSuffixList,
    ) -> bool {
        if self
            .evaluate_cell_zy(src, des, cell_type.name(), psl)
            .action
            == Action::Unset
        {
            return false;
        }
        self.set_cell(src, des, cell_type, Action::Unset);
        true
    }

    /// Write a cell only when it changes the effective, already-broadened
    /// outcome; a redundant write is suppressed, keeping the table minimal.
    pub fn set_cell_z(
        &mut self,
        src: &str,
        des: &str,
        cell_type: CellType,
        action: Action,
        psl: &PublicSuffixList,
    ) -> bool {
        if self.evaluate_cell_zy(src, des, cell_type.name(), psl).action == action {
            return false;
        }
        self.set_cell(src, des, cell_type, Action::Unset);
        if self.evaluate_cell_zy(src, des, cell_type.name(), psl).action == action {
            return true;
        }
        self.set_cell(src, des, cell_type, action);
        true
    }

    pub fn block_cell(
        &mut self,
        src: &str,
        des: &str,
        cell_type: CellType,
        psl: &PublicSuffixList,
    ) -> bool {
        self.set_cell_z(src, des, cell_type, Action::Block, psl)
    }

    pub fn allow_cell(
        &mut self,
        src: &str,
        des: &str,
        cell_type: CellType,
        psl: &PublicSuffixList,
    ) -> bool {
        self.set_cell_z(src, des, cell_type, Action::Allow, psl)
    }

    /// Read one exact cell, no broadening.
    pub fn evaluate_cell(&self, src: &str, des: &str, cell_type: CellType) -> Action {
        match self.rules.get(&rule_key(src, des)) {
            Some(bitmap) => Action::from_bits(bitmap >> cell_type.bit_offset()),
            None => Action::Unset,
        }
    }

    // Broaden the source hostname toward '*' at a fixed destination and
    // type; first non-unset field wins.
    fn evaluate_cell_z<'a>(
        &self,
        src: &'a str,
        des: &str,
        cell_type: CellType,
    ) -> Option<(Action, &'a str)> {
        let offset = cell_type.bit_offset();
        for s in hostname_chain(src) {
            if let Some(bitmap) = self.rules.get(&rule_key(s, des)) {
                let action = Action::from_bits(bitmap >> offset);
                if action != Action::Unset {
                    return Some((action, s));
                }
            }
        }
        None
    }

    /// Evaluate `(source, destination, request type)` against the rule set,
    /// from most specific to least specific:
    ///
    /// 1. the destination broadened toward its root, under the `*` type;
    /// 2. at destination `*`, the party-refined type (`script` becomes
    ///    `1p-script`/`3p-script`, `sub_frame` becomes `3p-frame` when
    ///    third-party), then the literal type;
    /// 3. the `(source chain, *, *)` catch-all.
    ///
    /// The source is broadened innermost at every step. The first matching
    /// cell in this fixed order wins.
    pub fn evaluate_cell_zy(
        &self,
        src: &str,
        des: &str,
        request_type: &str,
        psl: &PublicSuffixList,
    ) -> FirewallResult {
        if des.is_empty() {
            return FirewallResult::unset();
        }

        // Specific destination, any party, any type
        for d in hostname_chain(des) {
            if d == "*" {
                break;
            }
            if let Some((action, z)) = self.evaluate_cell_z(src, d, CellType::Any) {
                return FirewallResult {
                    action,
                    source: z.to_string(),
                    destination: d.to_string(),
                    cell_type: Some(CellType::Any),
                };
            }
        }

        let third_party = is_3rd_party(src, des, psl);

        // Any destination, party-refined type
        let refined = if third_party {
            match request_type {
                "script" => Some(CellType::ThirdPartyScript),
                "sub_frame" | "subdocument" => Some(CellType::ThirdPartyFrame),
                _ => None,
            }
        } else if request_type == "script" {
            Some(CellType::FirstPartyScript)
        } else {
            None
        };
        if let Some(cell_type) = refined {
            if let Some((action, z)) = self.evaluate_cell_z(src, "*", cell_type) {
                return FirewallResult {
                    action,
                    source: z.to_string(),
                    destination: "*".to_string(),
                    cell_type: Some(cell_type),
                };
            }
        }

        // Any destination, any party, specific type
        if let Some(cell_type) = CellType::from_name(request_type) {
            if cell_type != CellType::Any {
                if let Some((action, z)) = self.evaluate_cell_z(src, "*", cell_type) {
                    return FirewallResult {
                        action,
                        source: z.to_string(),
                        destination: "*".to_string(),
                        cell_type: Some(cell_type),
                    };
                }
            }
        }

        // Any destination, any party, any type
        if let Some((action, z)) = self.evaluate_cell_z(src, "*", CellType::Any) {
            return FirewallResult {
                action,
                source: z.to_string(),
                destination: "*".to_string(),
                cell_type: Some(CellType::Any),
            };
        }

        FirewallResult::unset()
    }

    /// The human-editable rule-text form, one `src des type action` line
    /// per set field, punycoded hostnames rendered as unicode.
    pub fn to_string(&self) -> String {
        let mut out: Vec<String> = Vec::with_capacity(self.rules.len());
        for key in self.rules.keys() {
            let Some(space) = key.find(' ') else { continue };
            let (src, des) = (&key[..space], &key[space + 1..]);
            for cell_type in CellType::ALL {
                let action = self.evaluate_cell(src, des, cell_type);
                if action == Action::Unset {
                    continue;
                }
                out.push(format!(
                    "{} {} {} {}",
                    hostname_to_unicode(src),
                    hostname_to_unicode(des),
                    cell_type,
                    action.name()
                ));
            }
        }
        out.sort();
        out.join("\n")
    }

    /// Parse the rule-text form produced by [`Firewall::to_string`]. Lines
    /// with invalid syntax are silently ignored.
    pub fn from_string(text: &str) -> Firewall {
        let mut firewall = Firewall::new();
        for raw_line in text.lines() {
            let mut line = raw_line;
            if let Some(pos) = line.find("# ") {
                line = &line[..pos];
            }
            let line = line.trim();
            if line.is_empty() || line.contains("://") {
                continue;
            }

            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != 4 {
                continue;
            }
            // hostname-based switch rules are a different table
            if fields[0].ends_with(':') {
                continue;
            }

            let Some(src) = hostname_to_ascii(fields[0]) else { continue };
            let Some(des) = hostname_to_ascii(fields[1]) else { continue };
            let Some(cell_type) = CellType::from_name(fields[2]) else {
                continue;
            };
            // A specific type is only meaningful at destination '*'.
            if des != "*" && cell_type != CellType::Any {
                continue;
            }
            let Some(action) = Action::from_name(fields[3]) else { continue };

            firewall.set_cell(&src, &des, cell_type, action);
        }
        firewall
    }
}

fn hostname_to_unicode(hostname: &str) -> String {
    if hostname == "*" || !hostname.contains("xn--") {
        return hostname.to_string();
    }
    let (unicode, result) = idna::domain_to_unicode(hostname);
    if result.is_ok() {
        unicode
    } else {
        hostname.to_string()
    }
}

fn hostname_to_ascii(hostname: &str) -> Option<String> {
    if hostname == "*" {
        return Some(hostname.to_string());
    }
    let lowered = hostname.to_lowercase();
    let ascii = if lowered.is_ascii() {
        lowered
    } else {
        idna::domain_to_ascii(&lowered).ok()?
    };
    if BAD_HOSTNAME.is_match(&ascii) {
        return None;
    }
    Some(ascii)
}
