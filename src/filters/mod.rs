//! Individual filter rules compiled from filter-list lines.

pub mod network;
