//! Bot API client and long-poll driver.
//!
//! [`TelegramClient`] speaks the HTTP API; [`TelegramPoller`] drives
//! `getUpdates` in a background task and implements the instance
//! subsystem's [`PollDriver`](crate::instance::PollDriver) contract.

pub mod client;
pub mod poller;
pub mod types;

pub use client::TelegramClient;
pub use poller::{TelegramPoller, UpdateHandler};
pub use types::{
    CallbackQuery, Chat, InlineKeyboardButton, InlineKeyboardMarkup, Message, ParseMode, Update,
    User,
};
