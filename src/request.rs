//! Structures describing one network request as seen by the matcher.

use thiserror::Error;

use crate::psl::PublicSuffixList;
use crate::url_parser;
use crate::utils::{self, UrlToken};

/// The type of resource requested from the URL endpoint.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum RequestType {
    Stylesheet,
    Script,
    Image,
    Subdocument,
    Xmlhttprequest,
    Websocket,
    Ping,
    Font,
    Media,
    Other,
}

/// Possible failure reasons when creating a [`Request`].
#[derive(Debug, Error, PartialEq)]
pub enum RequestError {
    #[error("hostname parsing failed")]
    HostnameParseError,
}

fn cpt_match_type(cpt: &str) -> RequestType {
    match cpt {
        "stylesheet" => RequestType::Stylesheet,
        "script" => RequestType::Script,
        "image" | "imageset" => RequestType::Image,
        "sub_frame" | "subdocument" => RequestType::Subdocument,
        "xhr" | "xmlhttprequest" => RequestType::Xmlhttprequest,
        "websocket" => RequestType::Websocket,
        "ping" | "beacon" => RequestType::Ping,
        "font" => RequestType::Font,
        "media" => RequestType::Media,
        _ => RequestType::Other,
    }
}

/// One network request, used as the interface for matching in
/// [`crate::Engine`] and [`crate::Firewall`]. Ephemeral: built by the
/// caller, consumed by reference, never retained.
#[derive(Clone, Debug)]
pub struct Request {
    pub request_type: RequestType,

    pub is_third_party: bool,
    /// Lower-cased request URL; all pattern matching runs against this.
    pub url: String,
    pub hostname: String,
    pub source_hostname: String,

    tokens: Vec<UrlToken>,
}

impl Request {
    /// Construct a new [`Request`]. The public suffix list decides the
    /// party classification: first-party when both hostnames share a
    /// registrable domain. An unparseable source URL classifies as
    /// third-party.
    pub fn new(
        url: &str,
        source_url: &str,
        request_type: &str,
        psl: &PublicSuffixList,
    ) -> Result<Request, RequestError> {
        let hostname =
            url_parser::hostname_from_uri(url).ok_or(RequestError::HostnameParseError)?;
        let schema = url_parser::schema_of_uri(url);

        let (source_hostname, third_party) = match url_parser::hostname_from_uri(source_url) {
            Some(source_hostname) => {
                let source_domain = url_parser::domain_from_hostname(&source_hostname, psl);
                let third_party = !url_parser::is_first_party(&source_domain, &hostname);
                (source_hostname, third_party)
            }
            None => (String::new(), true),
        };

        let raw_type = if schema == "ws" || schema == "wss" {
            "websocket"
        } else {
            request_type
        };

        Ok(Request::from_detailed_parameters(
            raw_type,
            url,
            hostname,
            source_hostname,
            third_party,
        ))
    }

    /// For callers that already hold parsed hostnames and party
    /// classification. Take care to pass data correctly.
    pub fn preparsed(
        url: &str,
        hostname: &str,
        source_hostname: &str,
        request_type: &str,
        third_party: bool,
    ) -> Request {
        Request::from_detailed_parameters(
            request_type,
            url,
            hostname.to_string(),
            source_hostname.to_string(),
            third_party,
        )
    }

    fn from_detailed_parameters(
        raw_type: &str,
        url: &str,
        hostname: String,
        source_hostname: String,
        third_party: bool,
    ) -> Request {
        let url = url.to_ascii_lowercase();
        let tokens = utils::tokenize_url(&url);
        Request {
            request_type: cpt_match_type(raw_type),
            url,
            hostname,
            source_hostname,
            is_third_party: third_party,
            tokens,
        }
    }

    /// URL tokens with their byte offsets, zero-hash fallback last.
    pub fn get_tokens(&self) -> &[UrlToken] {
        &self.tokens
    }
}
