// Own modules, currently everything is exposed, will need to limit
pub mod blocker;
pub mod engine;
pub mod filters;
pub mod firewall;
pub mod lists;
pub mod psl;
pub mod request;
pub mod strie;
pub mod url_parser;
#[doc(hidden)]
pub mod utils;

pub use crate::blocker::Verdict;
pub use crate::engine::Engine;
pub use crate::firewall::Firewall;
pub use crate::psl::PublicSuffixList;
pub use crate::request::Request;
