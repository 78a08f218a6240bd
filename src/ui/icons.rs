//! Status icons for terminal output. Each has a plain-text fallback for
//! terminals without emoji support.

use console::Emoji;

pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]  ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR] ");
pub static PENDING: Emoji<'_, '_> = Emoji("⏳ ", "[..]  ");
pub static LOCK: Emoji<'_, '_> = Emoji("🔒 ", "[LOCK]");
