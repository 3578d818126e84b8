//! Admin failure notifications over Telegram DM.

use async_trait::async_trait;

use teloxide::{prelude::*, types::ParseMode};

use relay_core::{
    domain::UserId,
    errors::{Error, ErrorCategory},
    ports::NotifierPort,
    Result,
};

#[derive(Clone)]
pub struct TelegramNotifier {
    bot: Bot,
}

impl TelegramNotifier {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl NotifierPort for TelegramNotifier {
    async fn notify(&self, user: UserId, category: ErrorCategory, details: &str) -> Result<()> {
        let text = format!(
            "🚨 <b>Relay delivery failure</b> ({})\n\n<code>{}</code>",
            category.as_str(),
            escape_html(details)
        );
        self.bot
            .send_message(teloxide::types::ChatId(user.0), text)
            .parse_mode(ParseMode::Html)
            .await
            .map_err(|e| Error::External(format!("telegram error: {e}")))?;
        Ok(())
    }
}

pub fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_html_metacharacters() {
        assert_eq!(
            escape_html("a < b & b > c"),
            "a &lt; b &amp; b &gt; c"
        );
        assert_eq!(escape_html("plain"), "plain");
    }
}
