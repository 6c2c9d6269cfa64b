//! External listeners: independent tasks that feed the chat queue.
//!
//! Each listener holds only a [`crate::core::ChatSender`]; none of them can
//! reach back into the loop, so shutdown is just cancelling their tasks.

pub mod mailbox;
pub mod telegram;

pub use mailbox::MailboxListener;
pub use telegram::{TelegramListener, TelegramSender};
