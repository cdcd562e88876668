//! Output formatting

use colored::Colorize;
use ecard_ifd::IfdStatus;
use ecard_ifd::terminal::IfdCapabilities;

/// Format a success message
pub(crate) fn success(message: &str) -> String {
    format!("✅ {}", message.green().bold())
}

/// Format a warning message
pub(crate) fn warning(message: &str) -> String {
    format!("⚠️  {}", message.yellow().bold())
}

/// One line per slot, with the ATR when known
pub(crate) fn status(status: &IfdStatus) -> String {
    let mut result = format!("{}", status.name.bold());
    if !status.connected {
        result.push_str(&format!(" {}", "(detached)".red()));
    }
    for slot in &status.slots {
        let presence = if slot.card_available {
            "card present".green()
        } else {
            "no card".dimmed()
        };
        result.push_str(&format!("\n  slot {}: {}", slot.index, presence));
        if let Some(atr) = &slot.atr {
            result.push_str(&format!(" (ATR {})", hex::encode_upper(atr)));
        }
    }
    result
}

pub(crate) fn capabilities(name: &str, capabilities: &IfdCapabilities) -> String {
    let mut result = format!("{}", name.bold().underline());
    for slot in &capabilities.slots {
        result.push_str(&format!("\n  {} {}", "slot".bold(), slot.index));
        for protocol in &slot.protocols {
            result.push_str(&format!("\n    {protocol}"));
        }
    }
    match capabilities.display {
        Some(display) => result.push_str(&format!(
            "\n  {}: {} lines x {} columns",
            "display".bold(),
            display.lines,
            display.columns
        )),
        None => result.push_str(&format!("\n  {}: none", "display".bold())),
    }
    match capabilities.keypad {
        Some(keypad) => result.push_str(&format!("\n  {}: {} keys", "keypad".bold(), keypad.keys)),
        None => result.push_str(&format!("\n  {}: none", "keypad".bold())),
    }
    result.push_str(&format!(
        "\n  {}: {}\n  {}: {}",
        "acoustic signal".bold(),
        capabilities.acoustic_signal,
        "optical signal".bold(),
        capabilities.optical_signal
    ));
    result
}
