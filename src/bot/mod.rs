//! The decimal stripper itself: collects forwarded messages per user and
//! splits the numbers in them into amounts and charges.

pub mod commands;
pub mod export;
pub mod handler;
pub mod numbers;
pub mod session;

pub use handler::{BotHandler, Reply};
pub use numbers::{AMOUNT_THRESHOLD, Category, DecimalSeparator, ExtractedNumber};
pub use session::{OutputFormat, Preferences, SessionStore};
