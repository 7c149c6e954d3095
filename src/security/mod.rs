//! Input guards shared by the sandbox and the runtime.
//!
//! - `rate_limit` — per-subject sliding-window call caps
//! - `denylist` — textual pattern filter and input sanitizer
//!
//! Neither of these is a security boundary. The denylist in particular is a
//! substring/regex match over the raw text: encoding tricks or any API not on
//! the list get straight through it.

pub mod denylist;
pub mod rate_limit;

pub use denylist::{sanitize_input, Denylist};
pub use rate_limit::RateLimiter;
