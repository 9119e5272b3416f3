//! Slash-command parsing and reply texts.
//!
//! Converts incoming text into a [`ParsedInput`] and renders every reply
//! the bot sends. Nothing here touches the network.

use crate::bot::numbers::{AMOUNT_THRESHOLD, DecimalSeparator, ExtractedNumber};
use crate::bot::session::{OutputFormat, Preferences};
use crate::telegram::{InlineKeyboardButton, InlineKeyboardMarkup};

/// Messages longer than this are truncated by the Bot API.
pub const MESSAGE_LIMIT: usize = 4000;

pub const NO_MESSAGES: &str = "❗ No messages collected yet. Forward some messages first.";
pub const NO_NUMBERS: &str = "❗ I couldn't find any numbers in your collected messages.";
pub const CLEARED: &str =
    "✅ Your collection has been cleared. You can start forwarding new messages now.";
pub const TEXT_ONLY: &str = "Please forward me a text message.";
pub const CSV_FAILED: &str =
    "❗ Sorry, there was an error creating your CSV file. Please try again later.";
pub const JSON_FAILED: &str =
    "❗ Sorry, there was an error creating your JSON file. Please try again later.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Process,
    Clear,
    Settings,
    Stats,
    ExportCsv,
    ExportJson,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandCategory {
    Basic,
    Export,
}

/// Descriptor for a recognized command.
#[derive(Debug, Clone, Copy)]
pub struct CommandInfo {
    pub command: Command,
    pub name: &'static str,
    pub description: &'static str,
    pub category: CommandCategory,
}

/// All recognized commands, in help order.
pub const COMMANDS: [CommandInfo; 8] = [
    CommandInfo {
        command: Command::Start,
        name: "start",
        description: "Begin collecting messages",
        category: CommandCategory::Basic,
    },
    CommandInfo {
        command: Command::Help,
        name: "help",
        description: "Show this help message",
        category: CommandCategory::Basic,
    },
    CommandInfo {
        command: Command::Process,
        name: "process",
        description: "Process all collected messages and separate amounts and charges",
        category: CommandCategory::Basic,
    },
    CommandInfo {
        command: Command::Clear,
        name: "clear",
        description: "Start over with a new collection",
        category: CommandCategory::Basic,
    },
    CommandInfo {
        command: Command::Settings,
        name: "settings",
        description: "Customize your number processing preferences",
        category: CommandCategory::Basic,
    },
    CommandInfo {
        command: Command::Stats,
        name: "stats",
        description: "View statistics about your collected messages",
        category: CommandCategory::Basic,
    },
    CommandInfo {
        command: Command::ExportCsv,
        name: "export_csv",
        description: "Export results as a CSV file with row-by-row sums",
        category: CommandCategory::Export,
    },
    CommandInfo {
        command: Command::ExportJson,
        name: "export_json",
        description: "Export results as a JSON file",
        category: CommandCategory::Export,
    },
];

/// Result of parsing an incoming text message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedInput {
    Command(Command),
    /// Starts with `/` but is not one of ours. Ignored.
    UnknownCommand(String),
    /// Anything else is collected.
    Text(String),
}

pub fn parse_input(input: &str) -> ParsedInput {
    let trimmed = input.trim();
    let Some(without_prefix) = trimmed.strip_prefix('/') else {
        return ParsedInput::Text(input.to_string());
    };
    let word = without_prefix.split_whitespace().next().unwrap_or_default();
    // Group chats address commands as /process@SomeBot.
    let name = word.split('@').next().unwrap_or_default().to_lowercase();

    match COMMANDS.iter().find(|c| c.name == name) {
        Some(info) => ParsedInput::Command(info.command),
        None => ParsedInput::UnknownCommand(name),
    }
}

/// A settings keyboard button press.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsAction {
    SetDecimal(DecimalSeparator),
    ToggleCurrency,
    SetFormat(OutputFormat),
    ToggleSilent,
}

impl SettingsAction {
    pub fn parse(data: &str) -> Option<Self> {
        if let Some(rest) = data.strip_prefix("set_decimal_") {
            return rest
                .chars()
                .last()
                .and_then(DecimalSeparator::from_char)
                .map(Self::SetDecimal);
        }
        if let Some(rest) = data.strip_prefix("set_format_") {
            return OutputFormat::parse(rest).map(Self::SetFormat);
        }
        match data {
            "toggle_currency" => Some(Self::ToggleCurrency),
            "toggle_silent" => Some(Self::ToggleSilent),
            _ => None,
        }
    }

    pub fn apply(self, prefs: &mut Preferences) {
        match self {
            Self::SetDecimal(sep) => prefs.decimal_separator = sep,
            Self::ToggleCurrency => prefs.include_currency = !prefs.include_currency,
            Self::SetFormat(format) => prefs.output_format = format,
            Self::ToggleSilent => prefs.silent_collection = !prefs.silent_collection,
        }
    }
}

pub fn welcome(username: Option<&str>) -> String {
    format!(
        "Hi {}! I'm a Decimal Stripper Bot that can separate amounts and charges.\n\n\
         Forward me messages containing numbers. I'll automatically categorize:\n\
         - Amounts (values > {t}): decimal parts will be stripped\n\
         - Charges (values ≤ {t}): kept exactly as they are\n\n\
         When you're ready, use /process to see the separated results.\n\n\
         Use /settings to customize how I process your numbers.\n\
         Use /clear to start a new collection.\n\
         Use /help for more information.",
        username.unwrap_or("there"),
        t = AMOUNT_THRESHOLD,
    )
}

/// Help text, HTML formatted.
pub fn help() -> String {
    let mut out = String::from("Here's how to use this bot:\n\n");
    for (category, title) in [
        (CommandCategory::Basic, "📝 <b>Basic Commands</b>:"),
        (CommandCategory::Export, "📊 <b>Export Options</b>:"),
    ] {
        out.push_str(title);
        out.push('\n');
        for info in COMMANDS.iter().filter(|c| c.category == category) {
            out.push_str(&format!("/{} - {}\n", info.name, info.description));
        }
        out.push('\n');
    }
    out.push_str(&format!(
        "💡 <b>How It Works</b>:\n\
         - Values > {t} are considered 'Amounts' and decimal parts are stripped\n\
         - Values ≤ {t} are considered 'Charges' and kept as they are\n\
         - Use /process when you're done collecting messages\n\n\
         🔎 <b>Supported Number Formats</b>:\n\
         - Whole numbers (123)\n\
         - Standard decimal (123.45)\n\
         - Comma separator (123,45)\n\
         - With currency symbols ($123.45, €123,45)\n\
         - Negative values (-123.45)",
        t = AMOUNT_THRESHOLD,
    ));
    out
}

/// Acknowledgement sent for a collected message when silent collection
/// is off.
pub fn collected(numbers: &[ExtractedNumber], include_currency: bool, total: usize) -> String {
    let found = if numbers.is_empty() {
        "✅ Message collected! (No numbers found)".to_string()
    } else {
        let preview: Vec<String> = numbers.iter().map(|n| n.display(include_currency)).collect();
        format!("✅ Message collected! Found these numbers: {}", preview.join(", "))
    };
    format!(
        "{found}\n📝 You now have {total} messages in your collection.\n\
         Forward more messages or use /process when ready."
    )
}

/// `/process` output, HTML formatted.
pub fn results(numbers: &[ExtractedNumber], prefs: &Preferences, message_count: usize) -> String {
    if numbers.is_empty() {
        return format!(
            "{NO_NUMBERS}\nTry changing the decimal separator in /settings if your numbers use a different format."
        );
    }
    let amounts = numbers.iter().filter(|n| n.is_amount()).count();
    let charges = numbers.len() - amounts;
    let footer = format!(
        "Found {} numbers ({amounts} amounts, {charges} charges) from {message_count} messages.",
        numbers.len()
    );

    match prefs.output_format {
        OutputFormat::Simple => {
            let list = |want_amount: bool| {
                let values: Vec<String> = numbers
                    .iter()
                    .filter(|n| n.is_amount() == want_amount)
                    .map(|n| n.display(prefs.include_currency))
                    .collect();
                if values.is_empty() {
                    "None found".to_string()
                } else {
                    values.join("\n")
                }
            };
            format!(
                "📊 <b>Processed Results</b>\n\n\
                 <b>Amounts (&gt;{t}):</b> [decimal parts stripped]\n{}\n\n\
                 <b>Charges (≤{t}):</b> [kept exactly as found]\n{}\n\n\
                 {footer}\n\
                 Use /export_csv or /export_json for detailed outputs.",
                list(true),
                list(false),
                t = AMOUNT_THRESHOLD,
            )
        }
        OutputFormat::Detailed => {
            let (mut amount_lines, mut charge_lines) = (Vec::new(), Vec::new());
            for (i, n) in numbers.iter().enumerate() {
                let line = format!(
                    "{}. Original: {} → Processed: {}",
                    i + 1,
                    n.full_match(),
                    n.display(prefs.include_currency)
                );
                if n.is_amount() {
                    amount_lines.push(line);
                } else {
                    charge_lines.push(line);
                }
            }
            let or_none = |lines: Vec<String>| {
                if lines.is_empty() {
                    "None found".to_string()
                } else {
                    lines.join("\n")
                }
            };
            let full = format!(
                "📊 <b>Detailed Results</b>\n\n\
                 <b>Amounts (&gt;{t}):</b> [decimal parts stripped]\n{}\n\n\
                 <b>Charges (≤{t}):</b> [kept exactly as found]\n{}\n\n\
                 {footer}",
                or_none(amount_lines),
                or_none(charge_lines),
                t = AMOUNT_THRESHOLD,
            );
            if full.chars().count() > MESSAGE_LIMIT {
                format!(
                    "📊 <b>Detailed Results (Truncated)</b>\n\n\
                     <b>Amounts Count:</b> {amounts}\n\
                     <b>Charges Count:</b> {charges}\n\n\
                     The full detailed output is too long to display. \
                     Please use /export_csv or /export_json for the complete results."
                )
            } else {
                full
            }
        }
    }
}

/// `/stats` output, HTML formatted.
pub fn stats(numbers: &[ExtractedNumber], message_count: usize) -> String {
    let amounts = numbers.iter().filter(|n| n.is_amount()).count();
    let with_decimal = numbers.iter().filter(|n| n.has_decimal).count();
    format!(
        "📊 <b>Collection Statistics</b>\n\n\
         📱 Total Messages: {message_count}\n\
         🔢 Total Numbers Found: {}\n\
         💰 Amounts (&gt;{t}): {amounts} - decimal parts stripped\n\
         💸 Charges (≤{t}): {} - kept exactly as found\n\n\
         🔍 Numbers with Decimal Part: {with_decimal}\n\
         🔍 Whole Numbers: {}\n\n\
         Use /process to see the actual values.",
        numbers.len(),
        numbers.len() - amounts,
        numbers.len() - with_decimal,
        t = AMOUNT_THRESHOLD,
    )
}

/// Settings summary, HTML formatted.
pub fn settings_text(prefs: &Preferences) -> String {
    let yes_no = |b: bool| if b { "Yes" } else { "No" };
    format!(
        "⚙️ <b>Current Settings</b>\n\n\
         🔢 Decimal Separator: '{}'\n\
         💱 Include Currency: {}\n\
         📋 Output Format: {}\n\
         🔕 Silent Collection: {}\n\n\
         Click below to change settings:",
        prefs.decimal_separator.as_char(),
        yes_no(prefs.include_currency),
        prefs.output_format.label(),
        yes_no(prefs.silent_collection),
    )
}

pub fn settings_keyboard(prefs: &Preferences) -> InlineKeyboardMarkup {
    let on_off = |b: bool| if b { "ON ✅" } else { "OFF ❌" };
    InlineKeyboardMarkup {
        inline_keyboard: vec![
            vec![
                InlineKeyboardButton::callback("Decimal: .", "set_decimal_."),
                InlineKeyboardButton::callback("Decimal: ,", "set_decimal_,"),
            ],
            vec![InlineKeyboardButton::callback(
                format!("Currency: {}", on_off(prefs.include_currency)),
                "toggle_currency",
            )],
            vec![
                InlineKeyboardButton::callback("Format: Simple", "set_format_simple"),
                InlineKeyboardButton::callback("Format: Detailed", "set_format_detailed"),
            ],
            vec![InlineKeyboardButton::callback(
                format!("Silent collection: {}", on_off(prefs.silent_collection)),
                "toggle_silent",
            )],
        ],
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::bot::numbers::extract;

    #[test]
    fn parses_known_commands() {
        assert_eq!(parse_input("/process"), ParsedInput::Command(Command::Process));
        assert_eq!(parse_input("  /Export_CSV  "), ParsedInput::Command(Command::ExportCsv));
        assert_eq!(
            parse_input("/stats@DecimalStripperBot"),
            ParsedInput::Command(Command::Stats)
        );
    }

    #[test]
    fn unknown_commands_are_not_collected() {
        assert_eq!(
            parse_input("/bank"),
            ParsedInput::UnknownCommand("bank".to_string())
        );
    }

    #[test]
    fn plain_text_is_collected_verbatim() {
        let text = "Paid Rs 1500.50 to 9800000000";
        assert_eq!(parse_input(text), ParsedInput::Text(text.to_string()));
    }

    #[test]
    fn settings_callbacks() {
        assert_eq!(
            SettingsAction::parse("set_decimal_,"),
            Some(SettingsAction::SetDecimal(DecimalSeparator::Comma))
        );
        assert_eq!(
            SettingsAction::parse("set_format_detailed"),
            Some(SettingsAction::SetFormat(OutputFormat::Detailed))
        );
        assert_eq!(SettingsAction::parse("select_bank_3"), None);

        let mut prefs = Preferences::default();
        SettingsAction::ToggleSilent.apply(&mut prefs);
        SettingsAction::ToggleCurrency.apply(&mut prefs);
        assert!(!prefs.silent_collection);
        assert!(prefs.include_currency);
    }

    #[test]
    fn help_lists_every_command() {
        let text = help();
        for info in COMMANDS {
            assert!(text.contains(&format!("/{}", info.name)), "missing {}", info.name);
        }
        assert!(text.find("Export Options").unwrap() > text.find("/stats").unwrap());
    }

    #[test]
    fn simple_results_split_amounts_and_charges() {
        let numbers = extract("$1250.75 fee $10.50", DecimalSeparator::Dot);
        let prefs = Preferences {
            include_currency: true,
            ..Preferences::default()
        };
        let text = results(&numbers, &prefs, 1);
        assert!(text.contains("[decimal parts stripped]\n$1250\n"));
        assert!(text.contains("[kept exactly as found]\n$10.50\n"));
        assert!(text.contains("Found 2 numbers (1 amounts, 1 charges) from 1 messages."));
    }

    #[test]
    fn simple_results_mark_empty_category() {
        let numbers = extract("5 and 6", DecimalSeparator::Dot);
        let text = results(&numbers, &Preferences::default(), 1);
        assert!(text.contains("[decimal parts stripped]\nNone found"));
    }

    #[test]
    fn detailed_results_number_every_match() {
        let numbers = extract("100.5 then 2.25", DecimalSeparator::Dot);
        let prefs = Preferences {
            output_format: OutputFormat::Detailed,
            ..Preferences::default()
        };
        let text = results(&numbers, &prefs, 1);
        assert!(text.contains("1. Original: 100.5 → Processed: 100"));
        assert!(text.contains("2. Original: 2.25 → Processed: 2.25"));
    }

    #[test]
    fn long_detailed_results_are_truncated() {
        let body = (0..400).map(|i| format!("{}.99", 100 + i)).collect::<Vec<_>>().join(" ");
        let numbers = extract(&body, DecimalSeparator::Dot);
        let prefs = Preferences {
            output_format: OutputFormat::Detailed,
            ..Preferences::default()
        };
        let text = results(&numbers, &prefs, 1);
        assert!(text.contains("Truncated"));
        assert!(text.contains("<b>Amounts Count:</b> 400"));
        assert!(text.chars().count() <= MESSAGE_LIMIT);
    }

    #[test]
    fn no_numbers_suggests_changing_separator() {
        let text = results(&[], &Preferences::default(), 3);
        assert!(text.starts_with(NO_NUMBERS));
        assert!(text.contains("/settings"));
    }

    #[test]
    fn stats_count_kinds() {
        let numbers = extract("100.5 20 7.25 300", DecimalSeparator::Dot);
        let text = stats(&numbers, 2);
        assert!(text.contains("Total Messages: 2"));
        assert!(text.contains("Total Numbers Found: 4"));
        assert!(text.contains("Amounts (&gt;50): 2"));
        assert!(text.contains("Numbers with Decimal Part: 2"));
        assert!(text.contains("Whole Numbers: 2"));
    }

    #[test]
    fn settings_keyboard_reflects_toggles() {
        let prefs = Preferences {
            include_currency: true,
            ..Preferences::default()
        };
        let kb = settings_keyboard(&prefs);
        assert_eq!(kb.inline_keyboard.len(), 4);
        assert_eq!(kb.inline_keyboard[1][0].text, "Currency: ON ✅");
        assert_eq!(kb.inline_keyboard[3][0].text, "Silent collection: ON ✅");
        assert!(settings_text(&prefs).contains("Decimal Separator: '.'"));
    }

    #[test]
    fn acknowledgement_previews_numbers() {
        let numbers = extract("€99.90 and 3", DecimalSeparator::Dot);
        assert!(collected(&numbers, true, 4).starts_with("✅ Message collected! Found these numbers: €99, 3\n"));
        assert!(collected(&[], false, 1).contains("(No numbers found)"));
    }
}
