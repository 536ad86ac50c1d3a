//! Client bindings for the KDE output device/management/order protocols,
//! generated from the protocol description. Nothing outside the Wayland
//! backend touches these types.

#![allow(missing_docs)]

use wayland_client;
use wayland_client::protocol::*;

pub mod __interfaces {
    use wayland_client::protocol::__interfaces::*;
    wayland_scanner::generate_interfaces!("./protocols/kde-output.xml");
}
use self::__interfaces::*;

wayland_scanner::generate_client_code!("./protocols/kde-output.xml");
