//! decistrip: a chat bot that strips decimals from forwarded amounts.
//!
//! Users forward messages containing numbers; the bot splits them into
//! amounts (decimal part stripped) and charges (kept verbatim) and can
//! export the result as CSV or JSON. The [`instance`] module makes sure at
//! most one process polls the bot API at any time.

pub mod bot;
pub mod cli;
pub mod config;
pub mod error;
pub mod instance;
pub mod keep_alive;
pub mod telegram;

pub use config::Config;
pub use error::{Error, Result};
