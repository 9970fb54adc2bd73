use std::sync::Arc;

use serenity::all::{ActionRowComponent, ComponentInteraction, Interaction, ModalInteraction};
use serenity::async_trait;
use serenity::builder::{
    CreateAttachment, CreateInteractionResponse, CreateInteractionResponseMessage, CreateMessage,
    EditInteractionResponse,
};
use serenity::model::channel::{Channel, ChannelType};
use serenity::model::gateway::Ready;
use serenity::model::id::{ChannelId, GuildId, UserId};
use serenity::model::user::User;
use serenity::model::voice::VoiceState;
use serenity::prelude::*;
use songbird::SerenityInit;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

mod config;
mod error;
mod panel;
mod player;
mod sources;
mod store;

use crate::config::Config;
use crate::store::Database;

/// Shared context: built once in `main`, reached from every handler
/// through the client TypeMap.
pub struct App {
    pub registry: player::Registry,
    pub db: Mutex<Database>,
    pub config: Mutex<Config>,
    pub source: Arc<dyn sources::MediaSource>,
    pub panel: Mutex<panel::PanelRefs>,
}

pub struct AppKey;
impl TypeMapKey for AppKey {
    type Value = Arc<App>;
}

impl App {
    pub async fn get(ctx: &Context) -> Arc<App> {
        ctx.data
            .read()
            .await
            .get::<AppKey>()
            .cloned()
            .expect("App placed in at initialisation.")
    }
}

struct Handler;

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("bot {} is ready ({} guilds)", ready.user.name, ctx.cache.guild_count());

        let app = App::get(&ctx).await;
        let (auto_join, auto_send, allowed) = {
            let config = app.config.lock().await;
            (
                config.auto_join_voice_channel(),
                config.auto_send_channel(),
                config.allowed_guild(),
            )
        };

        if let Some(voice_channel) = auto_join {
            match ctx.http.get_channel(voice_channel).await {
                Ok(Channel::Guild(channel))
                    if matches!(channel.kind, ChannelType::Voice | ChannelType::Stage) =>
                {
                    let guild_id = channel.guild_id;
                    if allowed.is_some_and(|g| g != guild_id) {
                        error!("voice channel {voice_channel} is not on the allowed guild, skipping auto-join");
                    } else {
                        let player = app.registry.get_or_create(guild_id).await;
                        match player::connect(&ctx, guild_id, voice_channel).await {
                            Ok(()) => {
                                player::refresh_idle_timer(&ctx, guild_id, &player).await;
                            }
                            Err(e) => error!("auto-join failed: {e}"),
                        }
                    }
                }
                Ok(_) => error!("channel {voice_channel} is not a voice channel"),
                Err(e) => error!("could not fetch voice channel {voice_channel}: {e}"),
            }
        }

        if let Some(text_channel) = auto_send {
            match ctx.http.get_channel(text_channel).await {
                Ok(Channel::Guild(channel)) if channel.kind == ChannelType::Text => {
                    let guild_id = channel.guild_id;
                    if allowed.is_some_and(|g| g != guild_id) {
                        error!("panel channel {text_channel} is not on the allowed guild, skipping auto-send");
                    } else if let Err(e) = panel::bootstrap(&ctx, guild_id, text_channel).await {
                        error!("could not bootstrap the control panel: {e}");
                    }
                }
                Ok(_) => error!("channel {text_channel} is not a text channel"),
                Err(e) => error!("could not fetch panel channel {text_channel}: {e}"),
            }
        }
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        let allowed = {
            let app = App::get(&ctx).await;
            let config = app.config.lock().await;
            config.allowed_guild()
        };

        match interaction {
            Interaction::Component(mc) => {
                if allowed.is_some_and(|g| mc.guild_id != Some(g)) {
                    return;
                }
                handle_button(&ctx, &mc).await;
            }
            Interaction::Modal(mi) => {
                if allowed.is_some_and(|g| mi.guild_id != Some(g)) {
                    return;
                }
                handle_modal(&ctx, mi).await;
            }
            _ => {}
        }
    }

    /// Alone-in-channel watcher: when a leave empties the channel down to
    /// the bot, re-check after the configured timeout and bail out.
    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let Some(old_channel) = old.as_ref().and_then(|s| s.channel_id) else {
            return;
        };
        if new.channel_id.is_some() {
            return;
        }
        let Some(guild_id) = old.as_ref().and_then(|s| s.guild_id).or(new.guild_id) else {
            return;
        };

        let app = App::get(&ctx).await;
        {
            let config = app.config.lock().await;
            if config.allowed_guild().is_some_and(|g| g != guild_id) {
                return;
            }
        }

        if !bot_alone_in(&ctx, guild_id, old_channel) {
            return;
        }
        if app.registry.get(guild_id).await.is_none() {
            return;
        }
        if player::current_call_channel(&ctx, guild_id).await.is_none() {
            return;
        }

        let timeout = { app.db.lock().await.disconnect_timeout() };
        info!(
            "alone in channel {old_channel}, disconnecting in {}s unless someone returns",
            timeout.as_secs()
        );

        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if !bot_alone_in(&ctx, guild_id, old_channel) {
                return;
            }
            let app = App::get(&ctx).await;
            if let Some(player) = app.registry.get(guild_id).await {
                player::disconnect(&ctx, guild_id, &player).await;
                panel::update_control(&ctx, guild_id).await;
                info!("disconnected after being left alone in the channel");
            }
        });
    }
}

fn voice_channel_for_user(ctx: &Context, guild_id: GuildId, user_id: UserId) -> Option<ChannelId> {
    ctx.cache
        .guild(guild_id)
        .and_then(|guild| guild.voice_states.get(&user_id).and_then(|vs| vs.channel_id))
}

fn bot_alone_in(ctx: &Context, guild_id: GuildId, channel: ChannelId) -> bool {
    let bot_id = ctx.cache.current_user().id;
    let Some(guild) = ctx.cache.guild(guild_id) else {
        return false;
    };
    let mut members = guild
        .voice_states
        .values()
        .filter(|vs| vs.channel_id == Some(channel));
    match (members.next(), members.next()) {
        (Some(only), None) => only.user_id == bot_id,
        _ => false,
    }
}

/// The panel is open to everyone; single gate in case that changes.
fn has_permission(_user: &User) -> bool {
    true
}

fn modal_value(mi: &ModalInteraction, id: &str) -> Option<String> {
    for row in &mi.data.components {
        for component in &row.components {
            if let ActionRowComponent::InputText(input) = component {
                if input.custom_id == id {
                    return input.value.clone();
                }
            }
        }
    }
    None
}

async fn ack(ctx: &Context, mc: &ComponentInteraction) {
    let _ = mc
        .create_response(&ctx.http, CreateInteractionResponse::Acknowledge)
        .await;
}

async fn button_reply(ctx: &Context, mc: &ComponentInteraction, content: &str) {
    let _ = mc
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new()
                    .content(content)
                    .ephemeral(true),
            ),
        )
        .await;
}

async fn modal_reply(ctx: &Context, mi: &ModalInteraction, content: &str) {
    let _ = mi
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new()
                    .content(content)
                    .ephemeral(true),
            ),
        )
        .await;
}

async fn handle_button(ctx: &Context, mc: &ComponentInteraction) {
    if !has_permission(&mc.user) {
        return ack(ctx, mc).await;
    }
    let Some(guild_id) = mc.guild_id else {
        return;
    };
    let app = App::get(ctx).await;
    let Some(player) = app.registry.get(guild_id).await else {
        return ack(ctx, mc).await;
    };

    match mc.data.custom_id.as_str() {
        "add_song" | "add_next" => {
            let Some(user_channel) = voice_channel_for_user(ctx, guild_id, mc.user.id) else {
                return button_reply(ctx, mc, "You must be in a voice channel to add a song.")
                    .await;
            };
            if let Some(bot_channel) = player::current_call_channel(ctx, guild_id).await {
                if bot_channel != user_channel {
                    return button_reply(
                        ctx,
                        mc,
                        "Bot is already playing music in another channel.",
                    )
                    .await;
                }
            }
            let modal = if mc.data.custom_id == "add_next" {
                panel::song_input_modal("add_next_modal", "Add Next (skip queue)")
            } else {
                panel::song_input_modal("add_song_modal", "Add Song")
            };
            let _ = mc
                .create_response(&ctx.http, CreateInteractionResponse::Modal(modal))
                .await;
        }
        "pause_resume" => {
            ack(ctx, mc).await;
            {
                let mut state = player.lock().await;
                if state.paused {
                    state.resume();
                } else {
                    state.pause();
                }
            }
            panel::update_control(ctx, guild_id).await;
        }
        "connect_disconnect" => {
            ack(ctx, mc).await;
            if player::current_call_channel(ctx, guild_id).await.is_some() {
                player::disconnect(ctx, guild_id, &player).await;
            } else if let Some(user_channel) = voice_channel_for_user(ctx, guild_id, mc.user.id) {
                match player::connect(ctx, guild_id, user_channel).await {
                    Ok(()) => {
                        let resume = {
                            let state = player.lock().await;
                            !state.playing && !state.queue.is_empty()
                        };
                        if resume {
                            player::play_next(ctx, guild_id).await;
                        }
                    }
                    Err(e) => error!("connect failed: {e}"),
                }
            }
            panel::update_control(ctx, guild_id).await;
        }
        "skip" => {
            ack(ctx, mc).await;
            // stopping the track re-enters the advance path via the end
            // notifier; nothing playing means only the timer needs a look
            let skipped = { player.lock().await.skip() };
            if !skipped {
                player::refresh_idle_timer(ctx, guild_id, &player).await;
            }
        }
        "loop_mode" => {
            ack(ctx, mc).await;
            {
                player.lock().await.cycle_loop_mode();
            }
            panel::update_control(ctx, guild_id).await;
        }
        "clear_playlist" => {
            ack(ctx, mc).await;
            {
                player.lock().await.clear();
            }
            player::refresh_idle_timer(ctx, guild_id, &player).await;
            panel::update_control(ctx, guild_id).await;
        }
        "download_song" => {
            let _ = mc
                .create_response(
                    &ctx.http,
                    CreateInteractionResponse::Modal(panel::download_modal()),
                )
                .await;
        }
        _ => ack(ctx, mc).await,
    }
}

async fn handle_modal(ctx: &Context, mi: ModalInteraction) {
    match mi.data.custom_id.as_str() {
        "add_song_modal" | "add_next_modal" => handle_add_modal(ctx, mi).await,
        "download_song_modal" => handle_download_modal(ctx, mi).await,
        _ => {}
    }
}

async fn handle_add_modal(ctx: &Context, mi: ModalInteraction) {
    if !has_permission(&mi.user) {
        return modal_reply(ctx, &mi, "You do not have permission to use this bot.").await;
    }
    let Some(guild_id) = mi.guild_id else {
        return;
    };
    let app = App::get(ctx).await;
    if app.registry.get(guild_id).await.is_none() {
        return modal_reply(ctx, &mi, "Music player is not initialized.").await;
    }
    let Some(user_channel) = voice_channel_for_user(ctx, guild_id, mi.user.id) else {
        return modal_reply(ctx, &mi, "You must be in a voice channel to add a song.").await;
    };
    let Some(input) = modal_value(&mi, "song_url") else {
        return modal_reply(ctx, &mi, "❌ Error adding song.").await;
    };

    let _ = mi
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Defer(
                CreateInteractionResponseMessage::new().ephemeral(true),
            ),
        )
        .await;

    if player::current_call_channel(ctx, guild_id).await.is_none() {
        if let Err(e) = player::connect(ctx, guild_id, user_channel).await {
            error!("could not join voice channel: {e}");
            let _ = mi
                .edit_response(
                    &ctx.http,
                    EditInteractionResponse::new().content("Error connecting to voice channel."),
                )
                .await;
            return;
        }
    }

    let result = if mi.data.custom_id == "add_next_modal" {
        player::add_song_next(ctx, guild_id, &input, &mi.user).await
    } else {
        player::add_song(ctx, guild_id, &input, &mi.user).await
    };

    match result {
        Ok(()) => {
            let _ = mi.delete_response(&ctx.http).await;
        }
        Err(e) => {
            warn!("could not add \"{input}\": {e}");
            let _ = mi
                .edit_response(
                    &ctx.http,
                    EditInteractionResponse::new().content("❌ Error adding song."),
                )
                .await;
        }
    }
}

async fn handle_download_modal(ctx: &Context, mi: ModalInteraction) {
    if !has_permission(&mi.user) {
        return modal_reply(ctx, &mi, "You do not have permission to use this bot.").await;
    }
    let Some(url) = modal_value(&mi, "download_url") else {
        return;
    };

    let _ = mi
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Defer(
                CreateInteractionResponseMessage::new().ephemeral(true),
            ),
        )
        .await;

    let _ = mi
        .user
        .dm(
            &ctx.http,
            CreateMessage::new().content("⬇️ Starting song download..."),
        )
        .await;
    let _ = mi
        .edit_response(
            &ctx.http,
            EditInteractionResponse::new()
                .content("✅ Download started! Check your private messages."),
        )
        .await;

    let ctx = ctx.clone();
    let user = mi.user.clone();
    tokio::spawn(async move {
        download_and_send(ctx, url, user).await;
    });
}

/// Download through yt-dlp, DM the mp3, delete the temp file. Discord
/// rejects attachments over 25 MiB so oversized results are discarded.
async fn download_and_send(ctx: Context, url: String, user: User) {
    let app = App::get(&ctx).await;
    let path = match app.source.download_audio(&url).await {
        Ok(path) => path,
        Err(e) => {
            error!("download of {url} failed: {e}");
            let _ = user
                .dm(
                    &ctx.http,
                    CreateMessage::new()
                        .content("❌ Error downloading song. Check the URL and try again."),
                )
                .await;
            return;
        }
    };

    let too_large = tokio::fs::metadata(&path)
        .await
        .map(|m| m.len() > sources::MAX_UPLOAD_BYTES)
        .unwrap_or(true);
    if too_large {
        warn!("downloaded file exceeds the upload limit, discarding");
        let _ = tokio::fs::remove_file(&path).await;
        let _ = user
            .dm(
                &ctx.http,
                CreateMessage::new()
                    .content("❌ Error downloading song. Check the URL and try again."),
            )
            .await;
        return;
    }

    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "song.mp3".to_string());
            let title = song_title_from_file(&file_name);
            let message = CreateMessage::new()
                .content(format!("🎵 **{title}**\n✅ Download complete!"))
                .add_file(CreateAttachment::bytes(bytes, file_name));
            if let Err(e) = user.dm(&ctx.http, message).await {
                error!("could not deliver download: {e}");
            }
        }
        Err(e) => error!("could not read downloaded file: {e}"),
    }
    let _ = tokio::fs::remove_file(&path).await;
}

/// "jukeboard-123_Never_Gonna.mp3" -> "Never Gonna"
fn song_title_from_file(file_name: &str) -> String {
    let stem = file_name.strip_suffix(".mp3").unwrap_or(file_name);
    let title = stem.split_once('_').map(|(_, rest)| rest).unwrap_or(stem);
    title.replace('_', " ")
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = match Config::load().await {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = sources::ensure_yt_dlp().await {
        warn!("could not prepare yt-dlp: {e}; relying on the system installation");
    }

    let db = match Database::load_or_init(store::DATABASE_PATH).await {
        Ok(db) => db,
        Err(e) => {
            error!("could not open {}: {e}", store::DATABASE_PATH);
            std::process::exit(1);
        }
    };

    let token = config.token.clone();
    let api_key = config.youtube.api_key.clone();

    let app = Arc::new(App {
        registry: player::Registry::new(),
        db: Mutex::new(db),
        config: Mutex::new(config),
        source: Arc::new(sources::MediaTools::new(api_key)),
        panel: Mutex::new(panel::PanelRefs::default()),
    });

    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::GUILD_VOICE_STATES
        | GatewayIntents::MESSAGE_CONTENT;

    let mut client = Client::builder(&token, intents)
        .register_songbird()
        .event_handler(Handler)
        .await
        .expect("Err creating client");

    {
        let mut data = client.data.write().await;
        data.insert::<AppKey>(app);
    }

    if let Err(why) = client.start().await {
        error!("client error: {why:?}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_titles_are_cleaned_up() {
        assert_eq!(
            song_title_from_file("jukeboard-1700000000_Never_Gonna_Give_You_Up.mp3"),
            "Never Gonna Give You Up"
        );
        assert_eq!(song_title_from_file("plain.mp3"), "plain");
    }
}
