//! Owned lifecycle wrapper around the compiled rule set.
//!
//! `Empty/Compiling -> Frozen -> Optimized`, with `reset` returning to the
//! compiling state. Matching structures are only built at `freeze`, so a
//! half-compiled rule set is never visible to `check`; reloading lists
//! means building a new engine (or deserializing one) and swapping.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::blocker::{Blocker, BlockerLogData, ModifierDirective, Verdict};
use crate::filters::network::{ModifierKind, NetworkFilter, NetworkFilterError};
use crate::lists::{self, FilterParseEvent};
use crate::request::Request;

#[derive(Debug, Error, PartialEq)]
pub enum EngineError {
    /// Compiling into a frozen engine is a lifecycle-contract violation by
    /// the host; `reset` first.
    #[error("filters cannot be compiled after freeze")]
    AlreadyFrozen,
    #[error("engine has not been frozen yet")]
    NotFrozen,
    #[error("invalid filter: {0}")]
    Filter(#[from] NetworkFilterError),
    #[error("serialization failed")]
    SerializationError,
    #[error("deserialization failed")]
    DeserializationError,
}

#[derive(Debug)]
enum State {
    Compiling(Vec<NetworkFilter>),
    Frozen(Blocker),
    Optimized(Blocker),
}

#[derive(Serialize)]
struct SelfieRef<'a> {
    optimized: bool,
    blocker: &'a Blocker,
}

#[derive(Deserialize)]
struct Selfie {
    optimized: bool,
    blocker: Blocker,
}

pub struct Engine {
    state: State,
    debug: bool,
}

impl Default for Engine {
    fn default() -> Engine {
        Engine::new(false)
    }
}

impl Engine {
    /// A new, empty engine in the compiling state. With `debug` set,
    /// compiled filters keep their raw text for diagnostics.
    pub fn new(debug: bool) -> Engine {
        Engine {
            state: State::Compiling(Vec::new()),
            debug,
        }
    }

    /// Compile one filter line into the rule set.
    pub fn compile(&mut self, line: &str) -> Result<(), EngineError> {
        match &mut self.state {
            State::Compiling(filters) => {
                filters.push(NetworkFilter::parse(line, self.debug)?);
                Ok(())
            }
            _ => Err(EngineError::AlreadyFrozen),
        }
    }

    /// Compile a whole list, skipping malformed lines and returning their
    /// parse events.
    pub fn compile_list(
        &mut self,
        lines: impl IntoIterator<Item = impl AsRef<str>>,
    ) -> Result<Vec<FilterParseEvent>, EngineError> {
        match &mut self.state {
            State::Compiling(filters) => {
                let parsed = lists::parse_filters(lines, self.debug);
                filters.extend(parsed.filters);
                Ok(parsed.errors)
            }
            _ => Err(EngineError::AlreadyFrozen),
        }
    }

    /// Build the matching structures and make the rule set read-only.
    /// Idempotent once frozen.
    pub fn freeze(&mut self) {
        if let State::Compiling(filters) = &mut self.state {
            let filters = std::mem::take(filters);
            self.state = State::Frozen(Blocker::new(filters));
        }
    }

    /// Compact the frozen structures; matching behavior is unchanged.
    pub fn optimize(&mut self) -> Result<(), EngineError> {
        match std::mem::replace(&mut self.state, State::Compiling(Vec::new())) {
            State::Frozen(mut blocker) => {
                blocker.optimize();
                self.state = State::Optimized(blocker);
                Ok(())
            }
            State::Optimized(blocker) => {
                self.state = State::Optimized(blocker);
                Ok(())
            }
            compiling => {
                self.state = compiling;
                Err(EngineError::NotFrozen)
            }
        }
    }

    /// Discard everything and return to the compiling state.
    pub fn reset(&mut self) {
        self.state = State::Compiling(Vec::new());
    }

    pub fn is_frozen(&self) -> bool {
        !matches!(self.state, State::Compiling(_))
    }

    pub fn filter_count(&self) -> usize {
        match &self.state {
            State::Compiling(filters) => filters.len(),
            State::Frozen(blocker) | State::Optimized(blocker) => blocker.filter_count(),
        }
    }

    fn blocker(&self) -> Option<&Blocker> {
        match &self.state {
            State::Frozen(blocker) | State::Optimized(blocker) => Some(blocker),
            State::Compiling(_) => None,
        }
    }

    /// Match one request. Matching before `freeze` is unsupported and
    /// answers [`Verdict::NoMatch`].
    pub fn check(&self, request: &Request) -> Verdict {
        match self.blocker() {
            Some(blocker) => blocker.check(request),
            None => {
                debug_assert!(false, "matching against an engine that was never frozen");
                Verdict::NoMatch
            }
        }
    }

    /// Like [`Engine::check`], also reporting the deciding filter.
    pub fn check_with_log_data(&self, request: &Request) -> (Verdict, Option<BlockerLogData>) {
        match self.blocker() {
            Some(blocker) => blocker.check_with_log_data(request),
            None => {
                debug_assert!(false, "matching against an engine that was never frozen");
                (Verdict::NoMatch, None)
            }
        }
    }

    /// Resolve modifier directives of one kind for the request.
    pub fn get_modifiers(
        &self,
        request: &Request,
        kind: ModifierKind,
    ) -> Option<Vec<ModifierDirective>> {
        self.blocker().and_then(|b| b.get_modifiers(request, kind))
    }

    /// The frozen rule set as one opaque blob: gzip-wrapped MessagePack.
    pub fn serialize(&self) -> Result<Vec<u8>, EngineError> {
        let (blocker, optimized) = match &self.state {
            State::Frozen(blocker) => (blocker, false),
            State::Optimized(blocker) => (blocker, true),
            State::Compiling(_) => return Err(EngineError::NotFrozen),
        };
        let payload = rmp_serde::to_vec(&SelfieRef { optimized, blocker })
            .map_err(|_| EngineError::SerializationError)?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&payload)
            .map_err(|_| EngineError::SerializationError)?;
        encoder.finish().map_err(|_| EngineError::SerializationError)
    }

    /// Restore an engine from a serialized blob. On failure, the current
    /// state is left untouched; callers fall back to recompiling from
    /// source text.
    pub fn deserialize(&mut self, serialized: &[u8]) -> Result<(), EngineError> {
        let mut decoder = GzDecoder::new(serialized);
        let mut payload = Vec::new();
        decoder
            .read_to_end(&mut payload)
            .map_err(|_| EngineError::DeserializationError)?;
        let selfie: Selfie =
            rmp_serde::from_slice(&payload).map_err(|_| EngineError::DeserializationError)?;
        self.state = if selfie.optimized {
            State::Optimized(selfie.blocker)
        } else {
            State::Frozen(selfie.blocker)
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psl::PublicSuffixList;

    fn psl() -> PublicSuffixList {
        PublicSuffixList::parse("com\nnet\ntest\n")
    }

    fn request(url: &str, source: &str, cpt: &str) -> Request {
        Request::new(url, source, cpt, &psl()).unwrap()
    }

    #[test]
    fn lifecycle_happy_path() {
        let mut engine = Engine::new(true);
        engine.compile("||ads.example.com^").unwrap();
        assert!(!engine.is_frozen());
        engine.freeze();
        assert!(engine.is_frozen());
        engine.optimize().unwrap();

        assert_eq!(
            engine.check(&request(
                "https://ads.example.com/banner.js",
                "https://site.test",
                "script"
            )),
            Verdict::Block
        );
    }

    #[test]
    fn compile_after_freeze_fails_loudly() {
        let mut engine = Engine::default();
        engine.compile("||ads.example.com^").unwrap();
        engine.freeze();
        assert_eq!(
            engine.compile("||more.example.com^"),
            Err(EngineError::AlreadyFrozen)
        );
        assert_eq!(
            engine.compile_list(["||more.example.com^"]).unwrap_err(),
            EngineError::AlreadyFrozen
        );
    }

    #[test]
    fn optimize_requires_freeze() {
        let mut engine = Engine::default();
        assert_eq!(engine.optimize(), Err(EngineError::NotFrozen));
    }

    #[test]
    fn reset_returns_to_compiling() {
        let mut engine = Engine::default();
        engine.compile("||ads.example.com^").unwrap();
        engine.freeze();
        engine.reset();
        assert!(!engine.is_frozen());
        engine.compile("||other.example.com^").unwrap();
        engine.freeze();
        assert_eq!(
            engine.check(&request(
                "https://ads.example.com/banner.js",
                "https://site.test",
                "script"
            )),
            Verdict::NoMatch
        );
    }

    #[test]
    fn compile_reports_filter_errors() {
        let mut engine = Engine::default();
        assert_eq!(
            engine.compile("/^regex$/"),
            Err(EngineError::Filter(
                NetworkFilterError::FullRegexUnsupported
            ))
        );
        // the engine remains usable
        engine.compile("||ads.example.com^").unwrap();
    }

    #[test]
    fn serialize_round_trip() {
        let mut engine = Engine::default();
        engine
            .compile_list(["||ads.example.com^", "@@||ads.example.com/allowed.js"])
            .unwrap();
        engine.freeze();
        engine.optimize().unwrap();
        let blob = engine.serialize().unwrap();

        let mut restored = Engine::default();
        restored.deserialize(&blob).unwrap();
        assert!(restored.is_frozen());

        for (url, cpt, verdict) in [
            ("https://ads.example.com/banner.js", "script", Verdict::Block),
            ("https://ads.example.com/allowed.js", "script", Verdict::Allow),
            ("https://ads.example.net/banner.js", "script", Verdict::NoMatch),
        ] {
            let req = request(url, "https://site.test", cpt);
            assert_eq!(restored.check(&req), verdict);
            assert_eq!(engine.check(&req), verdict);
        }
    }

    #[test]
    fn serialize_requires_freeze() {
        let engine = Engine::default();
        assert_eq!(engine.serialize().unwrap_err(), EngineError::NotFrozen);
    }

    #[test]
    fn corrupt_blob_leaves_state_untouched() {
        let mut engine = Engine::default();
        engine.compile("||ads.example.com^").unwrap();
        engine.freeze();

        assert_eq!(
            engine.deserialize(b"not a valid blob").unwrap_err(),
            EngineError::DeserializationError
        );
        // previous state still answers
        assert_eq!(
            engine.check(&request(
                "https://ads.example.com/banner.js",
                "https://site.test",
                "script"
            )),
            Verdict::Block
        );

        // truncated but gzip-framed data must fail the same way
        let blob = engine.serialize().unwrap();
        assert!(engine.deserialize(&blob[..blob.len() / 2]).is_err());
    }
}
