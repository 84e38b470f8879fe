//! Straylight — a physical console lock.
//!
//! Seizes a freshly allocated Linux virtual terminal, disables the escape
//! paths (VT switching, optionally SysRq and kernel console messages), and
//! releases the console only after a password matches the console occupant
//! or root.
//!
//! See `DESIGN.md` for full architecture documentation.

pub mod auth;
pub mod config;
pub mod kernel;
pub mod lock;
pub mod logging;
pub mod trial;
pub mod vt;
