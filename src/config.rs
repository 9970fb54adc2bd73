use serde::{Deserialize, Serialize};
use serenity::model::id::{ChannelId, GuildId, MessageId};

use crate::error::{BotError, BotResult};

pub const CONFIG_PATH: &str = "config.json";

const DEFAULT_EMBED_COLOR: u32 = 0x0099ff;

/// Bot configuration. Read as JSON5 so comments in the file are tolerated,
/// written back as plain pretty JSON when panel message ids change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub token: String,
    pub client_id: String,
    #[serde(default)]
    pub youtube: YoutubeConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_guild_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_join_voice_channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_send_channel_id: Option<String>,
    #[serde(default)]
    pub customization: Customization,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_embed_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_leaderboard_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub song_leaderboard_message_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct YoutubeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Customization {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embed_color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embed_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embed_thumbnail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embed_footer_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embed_footer_icon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embed_image: Option<String>,
}

impl Customization {
    pub fn color(&self) -> u32 {
        self.embed_color
            .as_deref()
            .and_then(parse_color)
            .unwrap_or(DEFAULT_EMBED_COLOR)
    }

    pub fn title(&self) -> &str {
        self.embed_title.as_deref().unwrap_or("🎵 Music Player")
    }
}

/// "#0099ff" or "0099ff" to the raw embed colour value.
pub fn parse_color(s: &str) -> Option<u32> {
    let hex = s.trim().trim_start_matches('#');
    u32::from_str_radix(hex, 16).ok()
}

fn parse_snowflake(field: &Option<String>) -> Option<u64> {
    field
        .as_deref()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| *v != 0)
}

impl Config {
    pub async fn load() -> BotResult<Self> {
        let contents = tokio::fs::read_to_string(CONFIG_PATH)
            .await
            .map_err(|e| BotError::Configuration(format!("could not read {CONFIG_PATH}: {e}")))?;
        let config: Config = json5::from_str(&contents)
            .map_err(|e| BotError::Configuration(format!("could not parse {CONFIG_PATH}: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects the file shipped with placeholder credentials.
    fn validate(&self) -> BotResult<()> {
        if self.token.trim().is_empty() || self.token == "YOUR_BOT_TOKEN" {
            return Err(BotError::Configuration(
                "set a real bot token in config.json".into(),
            ));
        }
        if self.client_id.trim().is_empty() || self.client_id == "YOUR_CLIENT_ID" {
            return Err(BotError::Configuration(
                "set a real client id in config.json".into(),
            ));
        }
        Ok(())
    }

    /// Write the config back so message ids survive restarts.
    pub async fn save(&self) -> BotResult<()> {
        let s = serde_json::to_string_pretty(self)
            .map_err(|e| BotError::Configuration(format!("could not serialize config: {e}")))?;
        tokio::fs::write(CONFIG_PATH, s)
            .await
            .map_err(BotError::Persistence)?;
        Ok(())
    }

    pub fn allowed_guild(&self) -> Option<GuildId> {
        parse_snowflake(&self.allowed_guild_id).map(GuildId::new)
    }

    pub fn auto_join_voice_channel(&self) -> Option<ChannelId> {
        parse_snowflake(&self.auto_join_voice_channel_id).map(ChannelId::new)
    }

    pub fn auto_send_channel(&self) -> Option<ChannelId> {
        parse_snowflake(&self.auto_send_channel_id).map(ChannelId::new)
    }

    pub fn last_embed_message(&self) -> Option<MessageId> {
        parse_snowflake(&self.last_embed_message_id).map(MessageId::new)
    }

    pub fn user_leaderboard_message(&self) -> Option<MessageId> {
        parse_snowflake(&self.user_leaderboard_message_id).map(MessageId::new)
    }

    pub fn song_leaderboard_message(&self) -> Option<MessageId> {
        parse_snowflake(&self.song_leaderboard_message_id).map(MessageId::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Config {
        json5::from_str(s).unwrap()
    }

    #[test]
    fn placeholder_token_is_rejected() {
        let config = parse(r#"{ "token": "YOUR_BOT_TOKEN", "clientId": "123" }"#);
        assert!(config.validate().is_err());
    }

    #[test]
    fn placeholder_client_id_is_rejected() {
        let config = parse(r#"{ "token": "abc.def", "clientId": "YOUR_CLIENT_ID" }"#);
        assert!(config.validate().is_err());
    }

    #[test]
    fn minimal_config_validates() {
        let config = parse(r#"{ "token": "abc.def", "clientId": "123456789" }"#);
        assert!(config.validate().is_ok());
        assert!(config.allowed_guild().is_none());
        assert_eq!(config.customization.color(), 0x0099ff);
    }

    #[test]
    fn snowflake_fields_parse() {
        let config = parse(
            r##"{
                "token": "abc.def",
                "clientId": "1",
                "allowedGuildId": "123456789012345678",
                "autoSendChannelId": "garbage",
                "customization": { "embedColor": "#FFD700" }
            }"##,
        );
        assert_eq!(
            config.allowed_guild(),
            Some(GuildId::new(123456789012345678))
        );
        assert!(config.auto_send_channel().is_none());
        assert_eq!(config.customization.color(), 0xFFD700);
    }

    #[test]
    fn color_parsing() {
        assert_eq!(parse_color("#0099ff"), Some(0x0099ff));
        assert_eq!(parse_color("FF6B6B"), Some(0xFF6B6B));
        assert_eq!(parse_color("not a color"), None);
    }
}
