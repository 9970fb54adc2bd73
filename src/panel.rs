use serenity::all::{ButtonStyle, InputTextStyle};
use serenity::builder::{
    CreateActionRow, CreateButton, CreateEmbed, CreateEmbedFooter, CreateInputText, CreateMessage,
    CreateModal, EditMessage,
};
use serenity::model::id::{ChannelId, GuildId, MessageId};
use serenity::model::Timestamp;
use serenity::prelude::Context;
use tracing::{info, warn};

use crate::config::Customization;
use crate::error::BotResult;
use crate::player::{self, GuildPlayer};
use crate::store::Database;
use crate::App;

const USER_BOARD_COLOR: u32 = 0xFFD700;
const SONG_BOARD_COLOR: u32 = 0xFF6B6B;
const QUEUE_PREVIEW: usize = 10;
const BOARD_SIZE: usize = 20;
const TITLE_MAX: usize = 50;

/// Where the three panel messages live once `ready` has bootstrapped them.
#[derive(Debug, Clone, Default)]
pub struct PanelRefs {
    pub guild: Option<GuildId>,
    pub channel: Option<ChannelId>,
    pub control: Option<MessageId>,
    pub users: Option<MessageId>,
    pub songs: Option<MessageId>,
}

pub fn control_embed(state: &GuildPlayer, custom: &Customization) -> CreateEmbed {
    let mut embed = CreateEmbed::new()
        .color(custom.color())
        .title(custom.title().to_string())
        .timestamp(Timestamp::now());

    // playing song's artwork wins over the configured default
    let song_thumb = state
        .current
        .as_ref()
        .and_then(|s| s.thumbnail.as_deref())
        .filter(|t| t.starts_with("http"));
    if let Some(thumb) = song_thumb {
        embed = embed.thumbnail(thumb.to_string());
    } else if let Some(thumb) = &custom.embed_thumbnail {
        embed = embed.thumbnail(thumb.clone());
    }

    if let Some(text) = &custom.embed_footer_text {
        let mut footer = CreateEmbedFooter::new(text.clone());
        if let Some(icon) = &custom.embed_footer_icon {
            footer = footer.icon_url(icon.clone());
        }
        embed = embed.footer(footer);
    }
    if let Some(image) = &custom.embed_image {
        embed = embed.image(image.clone());
    }

    if let Some(song) = &state.current {
        let status = if state.paused {
            "⏸️ Paused"
        } else {
            "▶️ Playing"
        };
        embed = embed
            .field("🎶 Now Playing:", song.title.clone(), false)
            .field("⏱️ Duration", song.duration.clone(), true)
            .field(
                "👤 Requested By",
                format!("<@{}>", song.requested_by),
                true,
            )
            .field("📊 Status", status, true);
    } else {
        embed = embed
            .field("🎶 Now Playing:", "Nothing is playing", false)
            .field("📋 Queue:", "Queue is empty", false);
    }

    if state.queue.is_empty() {
        embed = embed.field(
            "🎵 Playlist",
            "*Playlist is empty — add songs using the button below*",
            false,
        );
    } else {
        let mut list: Vec<String> = state
            .queue
            .iter()
            .take(QUEUE_PREVIEW)
            .enumerate()
            .map(|(i, song)| {
                format!(
                    "{}. **{}** - `{}` 👤 <@{}>",
                    i + 1,
                    song.title,
                    song.duration,
                    song.requested_by
                )
            })
            .collect();
        if state.queue.len() > QUEUE_PREVIEW {
            list.push("*...and more*".to_string());
        }
        embed = embed.field(
            format!("🎵 Playlist ({} songs)", state.queue.len()),
            list.join("\n"),
            false,
        );
    }

    embed
}

pub fn control_buttons(state: &GuildPlayer, connected: bool) -> Vec<CreateActionRow> {
    let pause_label = if state.paused {
        "▶️ Resume"
    } else {
        "⏸️ Pause"
    };
    let connect_label = if connected {
        "🔌 Disconnect"
    } else {
        "🔌 Connect"
    };

    let row1 = CreateActionRow::Buttons(vec![
        CreateButton::new("add_song")
            .style(ButtonStyle::Primary)
            .label("➕ Add Song"),
        CreateButton::new("add_next")
            .style(ButtonStyle::Primary)
            .label("⏫ Add Next"),
        CreateButton::new("pause_resume")
            .style(ButtonStyle::Secondary)
            .label(pause_label)
            .disabled(state.current.is_none()),
    ]);

    let row2 = CreateActionRow::Buttons(vec![
        CreateButton::new("connect_disconnect")
            .style(ButtonStyle::Secondary)
            .label(connect_label),
        CreateButton::new("skip")
            .style(ButtonStyle::Secondary)
            .label("⏭️ Skip")
            .disabled(state.current.is_none()),
        CreateButton::new("loop_mode")
            .style(ButtonStyle::Secondary)
            .label(state.loop_mode.label()),
    ]);

    let row3 = CreateActionRow::Buttons(vec![
        CreateButton::new("clear_playlist")
            .style(ButtonStyle::Danger)
            .label("🗑️ Clear Playlist")
            .disabled(state.queue.is_empty() && state.current.is_none()),
        CreateButton::new("download_song")
            .style(ButtonStyle::Success)
            .label("⬇️ Download Song"),
    ]);

    vec![row1, row2, row3]
}

pub fn song_input_modal(custom_id: &str, title: &str) -> CreateModal {
    let input = CreateInputText::new(InputTextStyle::Short, "YouTube URL or song name", "song_url")
        .placeholder("Enter URL or song name...")
        .required(true);
    CreateModal::new(custom_id, title).components(vec![CreateActionRow::InputText(input)])
}

pub fn download_modal() -> CreateModal {
    let input = CreateInputText::new(InputTextStyle::Short, "YouTube URL", "download_url")
        .placeholder("Enter YouTube URL...")
        .required(true);
    CreateModal::new("download_song_modal", "Download Song")
        .components(vec![CreateActionRow::InputText(input)])
}

fn medal(index: usize) -> String {
    match index {
        0 => "🥇".to_string(),
        1 => "🥈".to_string(),
        2 => "🥉".to_string(),
        n => format!("{}.", n + 1),
    }
}

fn truncate_title(title: &str, max: usize) -> String {
    if title.chars().count() <= max {
        return title.to_string();
    }
    let cut: String = title.chars().take(max).collect();
    format!("{cut}...")
}

pub fn user_leaderboard_embed(db: &Database) -> CreateEmbed {
    let embed = CreateEmbed::new()
        .color(USER_BOARD_COLOR)
        .title("🏆 Top 20 Users – Added Songs")
        .timestamp(Timestamp::now());

    let top = db.top_users(BOARD_SIZE);
    if top.is_empty() {
        return embed.description("No songs have been added yet.");
    }
    let lines: Vec<String> = top
        .iter()
        .enumerate()
        .map(|(i, (_, entry))| {
            format!("{} **{}** - {} songs", medal(i), entry.username, entry.count)
        })
        .collect();
    embed.description(lines.join("\n"))
}

pub fn song_leaderboard_embed(db: &Database) -> CreateEmbed {
    let embed = CreateEmbed::new()
        .color(SONG_BOARD_COLOR)
        .title("🎵 Top 20 Most Played Songs")
        .timestamp(Timestamp::now());

    let top = db.top_songs(BOARD_SIZE);
    if top.is_empty() {
        return embed.description("No songs have been played yet.");
    }
    let lines: Vec<String> = top
        .iter()
        .enumerate()
        .map(|(i, entry)| {
            format!(
                "{} **{}** - {}x",
                medal(i),
                truncate_title(&entry.title, TITLE_MAX),
                entry.play_count
            )
        })
        .collect();
    embed.description(lines.join("\n"))
}

/// Redraw the control message from the guild's current state.
pub async fn update_control(ctx: &Context, guild_id: GuildId) {
    let app = App::get(ctx).await;
    let (channel, message) = {
        let refs = app.panel.lock().await;
        if refs.guild != Some(guild_id) {
            return;
        }
        match (refs.channel, refs.control) {
            (Some(c), Some(m)) => (c, m),
            _ => return,
        }
    };
    let Some(player) = app.registry.get(guild_id).await else {
        return;
    };

    let connected = player::current_call_channel(ctx, guild_id).await.is_some();
    let custom = { app.config.lock().await.customization.clone() };
    let (embed, buttons) = {
        let state = player.lock().await;
        (
            control_embed(&state, &custom),
            control_buttons(&state, connected),
        )
    };

    let edit = EditMessage::new().embed(embed).components(buttons);
    if let Err(e) = channel.edit_message(&ctx.http, message, edit).await {
        warn!("could not update control message: {e}");
    }
}

/// Redraw both leaderboard messages.
pub async fn update_leaderboards(ctx: &Context) {
    let app = App::get(ctx).await;
    let (channel, users, songs) = {
        let refs = app.panel.lock().await;
        match refs.channel {
            Some(c) => (c, refs.users, refs.songs),
            None => return,
        }
    };
    let (user_embed, song_embed) = {
        let db = app.db.lock().await;
        (user_leaderboard_embed(&db), song_leaderboard_embed(&db))
    };

    if let Some(message) = users {
        let edit = EditMessage::new().embed(user_embed);
        if let Err(e) = channel.edit_message(&ctx.http, message, edit).await {
            warn!("could not update user leaderboard: {e}");
        }
    }
    if let Some(message) = songs {
        let edit = EditMessage::new().embed(song_embed);
        if let Err(e) = channel.edit_message(&ctx.http, message, edit).await {
            warn!("could not update song leaderboard: {e}");
        }
    }
}

/// Reuse a persisted panel message when it still exists, otherwise send a
/// fresh one. Returns the live message id.
async fn find_or_send(
    ctx: &Context,
    channel: ChannelId,
    existing: Option<MessageId>,
    embed: CreateEmbed,
    buttons: Option<Vec<CreateActionRow>>,
) -> BotResult<MessageId> {
    if let Some(id) = existing {
        if channel.message(&ctx.http, id).await.is_ok() {
            let mut edit = EditMessage::new().embed(embed.clone());
            if let Some(buttons) = buttons.clone() {
                edit = edit.components(buttons);
            }
            channel.edit_message(&ctx.http, id, edit).await?;
            info!("reusing existing panel message {id}");
            return Ok(id);
        }
        info!("previous panel message {id} not found, creating a new one");
    }

    let mut message = CreateMessage::new().embed(embed);
    if let Some(buttons) = buttons {
        message = message.components(buttons);
    }
    let sent = channel.send_message(&ctx.http, message).await?;
    Ok(sent.id)
}

/// Bootstrap the control panel and both leaderboards in the configured
/// channel, then persist the message ids for the next restart.
pub async fn bootstrap(ctx: &Context, guild_id: GuildId, channel: ChannelId) -> BotResult<()> {
    let app = App::get(ctx).await;
    let player = app.registry.get_or_create(guild_id).await;

    let (existing_control, existing_users, existing_songs, custom) = {
        let config = app.config.lock().await;
        (
            config.last_embed_message(),
            config.user_leaderboard_message(),
            config.song_leaderboard_message(),
            config.customization.clone(),
        )
    };

    let connected = player::current_call_channel(ctx, guild_id).await.is_some();
    let (embed, buttons) = {
        let state = player.lock().await;
        (
            control_embed(&state, &custom),
            control_buttons(&state, connected),
        )
    };
    let control = find_or_send(ctx, channel, existing_control, embed, Some(buttons)).await?;

    let (user_embed, song_embed) = {
        let db = app.db.lock().await;
        (user_leaderboard_embed(&db), song_leaderboard_embed(&db))
    };
    let users = find_or_send(ctx, channel, existing_users, user_embed, None).await?;
    let songs = find_or_send(ctx, channel, existing_songs, song_embed, None).await?;

    {
        let mut refs = app.panel.lock().await;
        refs.guild = Some(guild_id);
        refs.channel = Some(channel);
        refs.control = Some(control);
        refs.users = Some(users);
        refs.songs = Some(songs);
    }

    {
        let mut config = app.config.lock().await;
        config.last_embed_message_id = Some(control.to_string());
        config.user_leaderboard_message_id = Some(users.to_string());
        config.song_leaderboard_message_id = Some(songs.to_string());
        config.save().await?;
    }
    info!("control panel ready in channel {channel}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn medals_then_numbers() {
        assert_eq!(medal(0), "🥇");
        assert_eq!(medal(1), "🥈");
        assert_eq!(medal(2), "🥉");
        assert_eq!(medal(3), "4.");
        assert_eq!(medal(19), "20.");
    }

    #[test]
    fn long_titles_are_truncated() {
        let long = "x".repeat(80);
        let cut = truncate_title(&long, TITLE_MAX);
        assert_eq!(cut.chars().count(), TITLE_MAX + 3);
        assert!(cut.ends_with("..."));
        assert_eq!(truncate_title("short", TITLE_MAX), "short");
        // multi-byte titles must not split inside a character
        let unicode = "č".repeat(60);
        assert!(truncate_title(&unicode, TITLE_MAX).ends_with("..."));
    }
}
