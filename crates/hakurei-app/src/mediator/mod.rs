//! Host services exposed to the container: the Wayland compositor,
//! PulseAudio and the D-Bus message buses.

pub mod dbus;
pub mod pulse;
pub mod wayland;
