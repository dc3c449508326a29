//! Strata server: hosts a span of transformer blocks over HTTP.

pub mod api;
