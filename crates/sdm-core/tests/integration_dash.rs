//! DASH video+audio: both streams download to separate temp files and the
//! transcoder merge produces the target.

mod common;

use std::sync::Arc;

use sdm_core::config::RuntimeConfig;
use sdm_core::controller::Controller;
use sdm_core::item::{NoRefresh, Status, StreamDescriptor, Subtypes};
use sdm_core::registry::Registry;

use common::test_server;

#[cfg(unix)]
#[tokio::test]
async fn dash_streams_merge_into_target() {
    let video: Vec<u8> = (0..96 * 1024).map(|i| (i % 249) as u8).collect();
    let audio: Vec<u8> = (0..32 * 1024).map(|i| (i % 13) as u8).collect();
    let video_server = test_server::serve_body(video.clone());
    let audio_server = test_server::serve_body(audio.clone());

    let dir = tempfile::tempdir().unwrap();
    let mut cfg = RuntimeConfig::default();
    cfg.ffmpeg_path = common::fake_ffmpeg(dir.path());

    let c = Controller::new(
        cfg,
        Registry::open_at(dir.path().join("items.json")),
        Arc::new(NoRefresh),
    );
    let desc = StreamDescriptor {
        url: video_server.url("/"),
        audio_url: Some(audio_server.url("/")),
        subtypes: Subtypes {
            dash: true,
            ..Default::default()
        },
        ..Default::default()
    };
    let item = c.add(desc, dir.path(), Some("movie.mp4".into())).unwrap();
    c.run().await.unwrap();

    assert_eq!(item.status(), Status::Completed);
    // The stand-in transcoder concatenates its inputs, so the merged file
    // is exactly video bytes followed by audio bytes.
    let mut expected = video.clone();
    expected.extend_from_slice(&audio);
    assert_eq!(std::fs::read(item.target_file()).unwrap(), expected);
    assert_eq!(item.total_size(), (video.len() + audio.len()) as u64);
}
