pub mod api;
pub mod broadcast;
pub mod controller;
pub mod encoder;
pub mod sink;
pub mod source;
