//! Shared status icons for terminal output.

use console::Emoji;

pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "[SKIP]");
pub static RUNNING: Emoji<'_, '_> = Emoji("▶️  ", "[>]");
pub static RETRY: Emoji<'_, '_> = Emoji("🔄 ", "[RETRY]");
pub static MERGED: Emoji<'_, '_> = Emoji("🔀 ", "[MERGED]");
pub static BROOM: Emoji<'_, '_> = Emoji("🧹 ", "[CLEAN]");
pub static CLOCK: Emoji<'_, '_> = Emoji("⏱️  ", "[T]");
