//! Local terminal handling.
//!
//! - **raw_mode**: switching the operator's terminal into raw mode and back
//! - **escape**: recognizing escape sequences in operator input

pub mod escape;
pub mod raw_mode;
