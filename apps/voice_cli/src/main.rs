use std::{sync::Arc, time::Duration};

use anyhow::Result;
use clap::Parser;
use client_core::{
    config::load_settings, AuthenticatedUser, VoiceEvent, VoiceSession, VoiceSessionError,
    VoiceSessionHandle,
};
use realtime_integration::{
    memory::{InMemoryPresenceHub, SimulatedAudioDevices},
    MediaError,
};
use shared::domain::ChannelId;
use tracing::{info, warn};

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "general")]
    channel: String,
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    user_name: String,
    /// Simulate a refused microphone permission prompt.
    #[arg(long)]
    deny_microphone: bool,
    /// Number of mute toggles to perform after joining.
    #[arg(long, default_value_t = 2)]
    toggles: u32,
    /// Display name of a simulated member already in the channel.
    #[arg(long)]
    peer_name: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let args = Args::parse();
    let settings = load_settings();
    let hub = InMemoryPresenceHub::with_capacity(settings.event_capacity);
    let channel_id = ChannelId::new(args.channel.clone());

    let peer = match &args.peer_name {
        Some(peer_name) => {
            let peer = VoiceSession::open(
                channel_id.clone(),
                hub.clone(),
                SimulatedAudioDevices::granting(),
                &settings,
            );
            peer.set_user(Some(AuthenticatedUser::new(
                format!("peer-{peer_name}"),
                peer_name.clone(),
            )))
            .await;
            peer.connect().await?;
            Some(peer)
        }
        None => None,
    };

    let devices = if args.deny_microphone {
        SimulatedAudioDevices::denying(MediaError::PermissionDenied)
    } else {
        SimulatedAudioDevices::granting()
    };
    let session = VoiceSession::open(channel_id.clone(), hub.clone(), devices, &settings);
    let topic = session.topic().to_string();
    info!(channel_id = %session.channel_id(), %topic, "voice: joining");
    let handle: Arc<dyn VoiceSessionHandle> = session;

    let mut events = handle.subscribe_events();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                VoiceEvent::ConnectionStateChanged(Some(snapshot)) => {
                    println!("Joined {} at {}", snapshot.topic, snapshot.connected_at);
                }
                VoiceEvent::ConnectionStateChanged(None) => println!("Left voice channel"),
                VoiceEvent::ParticipantsUpdated { participants, .. } => {
                    let names = participants
                        .iter()
                        .map(|p| {
                            if p.is_muted {
                                format!("{} (muted)", p.user_name)
                            } else {
                                p.user_name.clone()
                            }
                        })
                        .collect::<Vec<_>>();
                    println!("In channel: [{}]", names.join(", "));
                }
                VoiceEvent::MuteChanged { is_muted } => {
                    println!("{}", if is_muted { "Muted" } else { "Unmuted" });
                }
                VoiceEvent::Error(notice) => println!("Voice error: {}", notice.message),
            }
        }
    });

    handle
        .set_user(Some(AuthenticatedUser::new(
            args.user_id.clone(),
            args.user_name.clone(),
        )))
        .await?;

    if let Err(err) = handle.connect().await {
        match err.downcast_ref::<VoiceSessionError>() {
            Some(VoiceSessionError::MediaAccessDenied(media)) => {
                warn!(%media, "voice: join failed");
                println!("Failed to join voice channel. Check microphone permissions.");
            }
            _ => return Err(err),
        }
    } else {
        for _ in 0..args.toggles {
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle.toggle_mute().await?;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let presence = hub.presence_state(&topic).await;
        println!("Presence on {topic}: {}", serde_json::to_string(&presence)?);
        info!(participants = handle.participants().await.len(), "voice: leaving");
        handle.disconnect().await?;
    }

    if let Some(peer) = peer {
        peer.close().await;
    }
    drop(handle);
    tokio::time::sleep(Duration::from_millis(50)).await;
    printer.abort();

    Ok(())
}
