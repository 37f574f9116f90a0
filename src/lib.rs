#![warn(rust_2018_idioms)]
#![warn(clippy::dbg_macro, clippy::print_stdout)]
#![doc = include_str!("../README.md")]

pub mod conn;
mod error;
mod meta;
pub mod params;
pub mod request;
pub mod response;
pub mod server;

pub use crate::{
    conn::Connection,
    error::*,
    params::Params,
    request::Request,
    response::Response,
    server::{Handler, Server},
};
