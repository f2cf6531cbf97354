use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tap::TapFallible;
use tracing::{error, info, warn};
use which::which;
use youtube_dl::{SingleVideo, YoutubeDl, YoutubeDlOutput};

use super::{AcquireError, AcquiredSource, Acquirer, ResolveError, ResolvedTrack, Resolver};

static DOWNLOAD_SEQ: AtomicU64 = AtomicU64::new(0);

fn find_exe(env_var: &str, exe_name: &str) -> Option<String> {
    let path = env::var(env_var)
        .ok()
        .or_else(|| which(exe_name).ok().map(|p| p.to_string_lossy().to_string()))?;

    info!("Using {exe_name} path: {path:?}");
    Some(path)
}

fn ytdl_exe() -> Result<String, ResolveError> {
    find_exe("YT_DLP_PATH", "yt-dlp")
        .ok_or_else(|| ResolveError::Provider("yt-dlp executable not found".to_owned()))
        .tap_err(|e| error!("yt-dlp path not found: {e:?}"))
}

fn ffmpeg_exe() -> Option<String> {
    find_exe("FFMPEG_PATH", "ffmpeg")
}

fn is_url(query: &str) -> bool {
    query.starts_with("http://") || query.starts_with("https://")
}

fn track_from_video(video: SingleVideo, fallback_locator: &str) -> ResolvedTrack {
    ResolvedTrack {
        title: video.title.unwrap_or_default(),
        source_locator: video
            .webpage_url
            .unwrap_or_else(|| fallback_locator.to_owned()),
        thumbnail: video.thumbnail,
        duration_seconds: video.duration.and_then(|d| d.as_f64()),
        is_live: video.is_live.unwrap_or(false),
    }
}

/// Resolves and downloads tracks with the yt-dlp command-line tool.
pub struct YtDlpProvider {
    download_dir: PathBuf,
    retries: u32,
}

impl YtDlpProvider {
    pub fn new(download_dir: PathBuf, retries: u32) -> Self {
        Self {
            download_dir,
            retries,
        }
    }

    async fn download_once(&self, source_locator: &str) -> Result<PathBuf, AcquireError> {
        let ytdl = ytdl_exe().map_err(|e| AcquireError::Failed(e.to_string()))?;
        // Each download gets its own directory so the produced file can be
        // located without guessing what yt-dlp named it.
        let seq = DOWNLOAD_SEQ.fetch_add(1, Ordering::Relaxed);
        let out_dir = self.download_dir.join(format!("dl-{seq}"));
        tokio::fs::create_dir_all(&out_dir)
            .await
            .map_err(|e| AcquireError::Failed(format!("error creating download dir: {e}")))?;

        let mut command = tokio::process::Command::new(&ytdl);
        command
            .arg("--no-playlist")
            .arg("-x")
            .args(["--audio-format", "mp3"])
            .arg("-o")
            .arg(out_dir.join("%(title)s.%(ext)s"))
            .arg(source_locator)
            .kill_on_drop(true);
        if let Some(ffmpeg) = ffmpeg_exe() {
            command.args(["--ffmpeg-location", &ffmpeg]);
        }

        let output = command
            .output()
            .await
            .map_err(|e| AcquireError::Failed(format!("error running yt-dlp: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AcquireError::Failed(format!(
                "yt-dlp exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let mut entries = tokio::fs::read_dir(&out_dir)
            .await
            .map_err(|e| AcquireError::Failed(format!("error reading download dir: {e}")))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| AcquireError::Failed(format!("error reading download dir: {e}")))?
        {
            if entry
                .file_type()
                .await
                .map(|t| t.is_file())
                .unwrap_or(false)
            {
                return Ok(entry.path());
            }
        }
        Err(AcquireError::Failed(
            "yt-dlp produced no output file".to_owned(),
        ))
    }
}

#[async_trait]
impl Resolver for YtDlpProvider {
    async fn resolve(&self, query: &str) -> Result<ResolvedTrack, ResolveError> {
        let source = if is_url(query) {
            query.to_owned()
        } else {
            format!("ytsearch1:{query}")
        };
        info!("extracting track metadata - this may take a few seconds");
        let output = YoutubeDl::new(source)
            .youtube_dl_path(ytdl_exe()?)
            .run_async()
            .await
            .map_err(|e| ResolveError::Provider(e.to_string()))
            .tap_err(|e| error!("error running yt-dlp: {e:?}"))?;
        info!("metadata extraction complete");

        match output {
            YoutubeDlOutput::SingleVideo(video) => {
                info!("found single track: {:?}", video.title);
                Ok(track_from_video(*video, query))
            }
            YoutubeDlOutput::Playlist(playlist) => {
                let first = playlist
                    .entries
                    .unwrap_or_default()
                    .into_iter()
                    .next()
                    .ok_or_else(|| ResolveError::NotFound(query.to_owned()))?;
                info!("found playlist entry: {:?}", first.title);
                Ok(track_from_video(first, query))
            }
        }
    }
}

#[async_trait]
impl Acquirer for YtDlpProvider {
    async fn acquire(&self, source_locator: &str) -> Result<AcquiredSource, AcquireError> {
        let mut last_err = AcquireError::Failed("no download attempts made".to_owned());
        for attempt in 1..=self.retries.max(1) {
            match self.download_once(source_locator).await {
                Ok(local_path) => {
                    info!("downloaded {source_locator} to {local_path:?}");
                    return Ok(AcquiredSource {
                        local_path,
                        duration_seconds: None,
                    });
                }
                Err(e) => {
                    warn!("download attempt {attempt} failed: {e:?}");
                    last_err = e;
                    if attempt < self.retries.max(1) {
                        tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                    }
                }
            }
        }
        Err(last_err)
    }
}
