//! Discord transport for the drudge job scheduler: slash-command intake,
//! gateway ingress, and outbound job notifications.

mod discord_helpers;
pub mod discord_runtime;

pub use discord_runtime::{run_discord_runtime, DiscordNotifier, DiscordRuntimeConfig};
