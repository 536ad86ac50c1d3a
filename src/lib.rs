//! Display topology discovery and configuration.
//!
//! A [`Backend`] connects to the session's display server, assembles the
//! live output topology into a [`Config`] snapshot and pushes requested
//! changes back. Two backends exist: an event-driven Wayland one speaking
//! the KDE output protocols and a polling XRandR one for X11 sessions.

pub mod backend;
pub mod config;
pub mod edid;
pub mod error;
pub mod geometry;
pub mod mode;
pub mod output;
pub mod screen;
pub mod wayland;
pub mod xrandr;

pub use backend::{BACKEND_ENV, Backend, BackendEvent, backend_from_env};
pub use config::{Config, Features, ValidityFlags};
pub use edid::Edid;
pub use error::BackendError;
pub use geometry::{Point, Rect, Size, SizeF};
pub use mode::Mode;
pub use output::{Output, OutputId, OutputType, Rotation};
pub use screen::Screen;
pub use wayland::WaylandBackend;
pub use xrandr::XrandrBackend;
