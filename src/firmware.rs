// Firmware Module - Validated firmware + LittleFS upload with progress
//
// Both images go to the device in one multipart POST to /update. The device
// picks the flash partition from each part's file name, which is why the names
// are checked before anything touches the network.
use futures::stream;
use reqwest::multipart::{Form, Part};
use reqwest::Body;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{info, warn};

use crate::device::DeviceClient;

/// Bytes handed to the transport per body chunk
const CHUNK_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum UploadValidationError {
    #[error("Invalid firmware filename. Firmware file name must start with 'firmware' and end with '.bin'")]
    InvalidFirmwareName,
    #[error("Invalid LittleFS filename. Firmware file name must start with 'littlefs' and end with '.bin'")]
    InvalidFilesystemName,
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error(transparent)]
    Validation(#[from] UploadValidationError),
    #[error("an upload is already in progress")]
    Busy,
    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{status_text}: {reason}")]
    Rejected { status_text: String, reason: String },
    #[error("error: {0}")]
    Transport(#[from] reqwest::Error),
}

/// A binary on local disk, named the way the device will see it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalImage {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
}

impl LocalImage {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, UploadError> {
        let path = path.as_ref().to_path_buf();
        let metadata = std::fs::metadata(&path).map_err(|source| UploadError::Io {
            path: path.clone(),
            source,
        })?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(LocalImage {
            name,
            path,
            size: metadata.len(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTask {
    pub firmware: LocalImage,
    pub filesystem: LocalImage,
}

fn has_image_name(name: &str, prefix: &str) -> bool {
    name.starts_with(prefix) && name.ends_with(".bin")
}

impl UploadTask {
    /// Check both file names before touching either file
    pub fn from_paths(firmware: impl AsRef<Path>, filesystem: impl AsRef<Path>) -> Result<Self, UploadError> {
        let named = |path: &Path| LocalImage {
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            path: path.to_path_buf(),
            size: 0,
        };
        UploadTask {
            firmware: named(firmware.as_ref()),
            filesystem: named(filesystem.as_ref()),
        }
        .validate()?;

        Ok(UploadTask {
            firmware: LocalImage::from_path(firmware)?,
            filesystem: LocalImage::from_path(filesystem)?,
        })
    }

    /// Case-sensitive; the firmware name is checked first
    pub fn validate(&self) -> Result<(), UploadValidationError> {
        if !has_image_name(&self.firmware.name, "firmware") {
            return Err(UploadValidationError::InvalidFirmwareName);
        }
        if !has_image_name(&self.filesystem.name, "littlefs") {
            return Err(UploadValidationError::InvalidFilesystemName);
        }
        Ok(())
    }

    pub fn total_bytes(&self) -> u64 {
        self.firmware.size + self.filesystem.size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadProgress {
    pub sent: u64,
    pub total: u64,
}

impl UploadProgress {
    /// floor(sent * 100 / total), clamped; an empty upload reports 0
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        let pct = (self.sent as u128 * 100) / self.total as u128;
        pct.min(100) as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The device took both images and a reboot was requested
    Rebooting { reboot_acknowledged: bool },
}

pub type ProgressFn = Arc<dyn Fn(UploadProgress) + Send + Sync>;

struct InFlightGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

pub struct FirmwareUpdateClient {
    device: DeviceClient,
    timeout: Duration,
    in_flight: Arc<AtomicBool>,
}

impl FirmwareUpdateClient {
    pub fn new(device: DeviceClient, timeout: Duration) -> Self {
        FirmwareUpdateClient {
            device,
            timeout,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    fn begin(&self) -> Option<InFlightGuard> {
        self.in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| InFlightGuard {
                flag: self.in_flight.clone(),
            })
    }

    /// Validate, upload both images and request a reboot on success.
    /// `on_progress` is called once per chunk as the transport pulls it.
    pub async fn submit(
        &self,
        task: &UploadTask,
        on_progress: ProgressFn,
    ) -> Result<UpdateOutcome, UploadError> {
        task.validate()?;
        let _guard = self.begin().ok_or(UploadError::Busy)?;

        let total = task.total_bytes();
        let sent = Arc::new(AtomicU64::new(0));
        on_progress(UploadProgress { sent: 0, total });

        let firmware = image_part(&task.firmware, total, &sent, &on_progress).await?;
        let filesystem = image_part(&task.filesystem, total, &sent, &on_progress).await?;
        let form = Form::new().part("firmware", firmware).part("spiffs", filesystem);

        info!(
            firmware = %task.firmware.name,
            filesystem = %task.filesystem.name,
            total,
            "uploading images"
        );
        let response = self
            .device
            .http()
            .post(self.device.url("/update"))
            .timeout(self.timeout)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let reason = response.text().await.unwrap_or_default();
            let status_text = match status.canonical_reason() {
                Some(text) => format!("{} {}", status.as_u16(), text),
                None => status.as_u16().to_string(),
            };
            return Err(UploadError::Rejected {
                status_text,
                reason: reason.trim().to_string(),
            });
        }

        // The device answers 200 even when Update.end() failed on its side
        warn!("upload accepted; image validity is not reported by the device");
        let reboot_acknowledged = match self.device.reboot().await {
            Ok(()) => true,
            Err(e) => {
                warn!("reboot request failed: {:#}", e);
                false
            }
        };
        Ok(UpdateOutcome::Rebooting {
            reboot_acknowledged,
        })
    }
}

async fn image_part(
    image: &LocalImage,
    total: u64,
    sent: &Arc<AtomicU64>,
    on_progress: &ProgressFn,
) -> Result<Part, UploadError> {
    let io_error = |source| UploadError::Io {
        path: image.path.clone(),
        source,
    };
    let file = File::open(&image.path).await.map_err(io_error)?;
    let len = file.metadata().await.map_err(io_error)?.len();

    // One chunk in memory at a time, read as the transport pulls
    let sent = sent.clone();
    let on_progress = on_progress.clone();
    let body = stream::try_unfold(file, move |mut file| {
        let sent = sent.clone();
        let on_progress = on_progress.clone();
        async move {
            let mut chunk = vec![0u8; CHUNK_SIZE];
            let n = file.read(&mut chunk).await?;
            if n == 0 {
                return Ok::<_, std::io::Error>(None);
            }
            chunk.truncate(n);
            let now = sent.fetch_add(n as u64, Ordering::SeqCst) + n as u64;
            on_progress(UploadProgress { sent: now, total });
            Ok(Some((chunk, file)))
        }
    });

    Ok(Part::stream_with_length(Body::wrap_stream(body), len)
        .file_name(image.name.clone())
        .mime_str("application/octet-stream")?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_device::FakeDevice;
    use std::sync::Mutex;

    fn image(name: &str) -> LocalImage {
        LocalImage {
            name: name.to_string(),
            path: PathBuf::from(name),
            size: 0,
        }
    }

    fn task(firmware: &str, filesystem: &str) -> UploadTask {
        UploadTask {
            firmware: image(firmware),
            filesystem: image(filesystem),
        }
    }

    struct TempDir(PathBuf);

    impl TempDir {
        fn new(tag: &str) -> Self {
            let dir = std::env::temp_dir().join(format!("dmxpanel-fw-{}-{}", tag, std::process::id()));
            std::fs::create_dir_all(&dir).unwrap();
            TempDir(dir)
        }

        fn write(&self, name: &str, len: usize) -> LocalImage {
            let path = self.0.join(name);
            std::fs::write(&path, vec![0xA5u8; len]).unwrap();
            LocalImage::from_path(path).unwrap()
        }
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }

    fn recorder() -> (ProgressFn, Arc<Mutex<Vec<u8>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let f: ProgressFn = Arc::new(move |p: UploadProgress| sink.lock().unwrap().push(p.percent()));
        (f, seen)
    }

    #[test]
    fn accepts_well_named_images() {
        assert_eq!(task("firmware_v2.bin", "littlefs_data.bin").validate(), Ok(()));
        assert_eq!(task("firmware.bin", "littlefs.bin").validate(), Ok(()));
    }

    #[test]
    fn firmware_name_is_checked_first() {
        let err = task("firm.bin", "littlefs.bin").validate().unwrap_err();
        assert_eq!(err, UploadValidationError::InvalidFirmwareName);
        assert_eq!(
            err.to_string(),
            "Invalid firmware filename. Firmware file name must start with 'firmware' and end with '.bin'"
        );

        // Both wrong still reports the firmware problem
        let err = task("image.bin", "fs.img").validate().unwrap_err();
        assert_eq!(err, UploadValidationError::InvalidFirmwareName);
    }

    #[test]
    fn filesystem_name_rules() {
        let err = task("firmware.bin", "LittleFS.bin").validate().unwrap_err();
        assert_eq!(err, UploadValidationError::InvalidFilesystemName);
        assert_eq!(
            err.to_string(),
            "Invalid LittleFS filename. Firmware file name must start with 'littlefs' and end with '.bin'"
        );
        assert!(task("firmware.bin", "littlefs.bin.gz").validate().is_err());
        assert!(task("firmware.BIN", "littlefs.bin").validate().is_err());
    }

    #[test]
    fn progress_percent_floors_and_clamps() {
        let p = |sent, total| UploadProgress { sent, total }.percent();
        assert_eq!(p(0, 0), 0);
        assert_eq!(p(1, 3), 33);
        assert_eq!(p(2, 3), 66);
        assert_eq!(p(999, 1000), 99);
        assert_eq!(p(1000, 1000), 100);
        assert_eq!(p(1200, 1000), 100);
    }

    #[test]
    fn rejection_renders_status_and_reason() {
        let err = UploadError::Rejected {
            status_text: "500 Internal Server Error".into(),
            reason: "Update failed".into(),
        };
        assert_eq!(err.to_string(), "500 Internal Server Error: Update failed");
    }

    #[tokio::test]
    async fn invalid_names_never_reach_the_device() {
        let device = FakeDevice::start().await;
        let client = FirmwareUpdateClient::new(device.client(), Duration::from_secs(5));
        let (progress, seen) = recorder();

        let err = client.submit(&task("firm.bin", "littlefs.bin"), progress).await.unwrap_err();
        assert!(matches!(
            err,
            UploadError::Validation(UploadValidationError::InvalidFirmwareName)
        ));
        assert!(device.state.uploads.lock().unwrap().is_empty());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn uploads_both_parts_then_reboots() {
        let dir = TempDir::new("ok");
        let task = UploadTask {
            firmware: dir.write("firmware_v2.bin", 40_000),
            filesystem: dir.write("littlefs_data.bin", 20_000),
        };
        let device = FakeDevice::start().await;
        let client = FirmwareUpdateClient::new(device.client(), Duration::from_secs(5));
        let (progress, seen) = recorder();

        let outcome = client.submit(&task, progress).await.unwrap();
        assert_eq!(
            outcome,
            UpdateOutcome::Rebooting {
                reboot_acknowledged: true
            }
        );

        let uploads = device.state.uploads.lock().unwrap().clone();
        assert_eq!(
            uploads,
            vec![vec![
                ("firmware".to_string(), "firmware_v2.bin".to_string(), 40_000),
                ("spiffs".to_string(), "littlefs_data.bin".to_string(), 20_000),
            ]]
        );
        assert_eq!(device.state.reboots.load(Ordering::SeqCst), 1);

        let seen = seen.lock().unwrap();
        // Initial report plus at least one per 16 KiB chunk: 3 for firmware, 2 for the filesystem
        assert!(seen.len() >= 1 + 3 + 2);
        assert_eq!(seen.first(), Some(&0));
        assert_eq!(seen.last(), Some(&100));
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn device_rejection_is_reported_without_reboot() {
        let dir = TempDir::new("rejected");
        let task = UploadTask {
            firmware: dir.write("firmware.bin", 100),
            filesystem: dir.write("littlefs.bin", 100),
        };
        let device = FakeDevice::start().await;
        device.state.update_status.store(500, Ordering::SeqCst);
        let client = FirmwareUpdateClient::new(device.client(), Duration::from_secs(5));
        let (progress, _) = recorder();

        let err = client.submit(&task, progress).await.unwrap_err();
        match err {
            UploadError::Rejected { status_text, reason } => {
                assert_eq!(status_text, "500 Internal Server Error");
                assert_eq!(reason, "Update failed");
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(device.state.reboots.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn second_upload_while_busy_is_refused() {
        let device = FakeDevice::start().await;
        let client = FirmwareUpdateClient::new(device.client(), Duration::from_secs(5));
        let held = client.begin().unwrap();
        let (progress, _) = recorder();

        let err = client
            .submit(&task("firmware.bin", "littlefs.bin"), progress.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Busy));

        drop(held);
        assert!(client.begin().is_some());
    }

    #[test]
    fn from_paths_validates_before_reading() {
        // Neither file exists, the name check still wins
        let err = UploadTask::from_paths("/nonexistent/firm.bin", "/nonexistent/littlefs.bin").unwrap_err();
        assert!(matches!(
            err,
            UploadError::Validation(UploadValidationError::InvalidFirmwareName)
        ));

        let err = UploadTask::from_paths("/nonexistent/firmware.bin", "/nonexistent/littlefs.bin").unwrap_err();
        assert!(matches!(err, UploadError::Io { .. }));

        let dir = TempDir::new("paths");
        let fw = dir.write("firmware.bin", 10);
        let fs = dir.write("littlefs.bin", 20);
        let task = UploadTask::from_paths(&fw.path, &fs.path).unwrap();
        assert_eq!(task.total_bytes(), 30);
        assert_eq!(task.firmware.name, "firmware.bin");
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = LocalImage::from_path("/nonexistent/firmware.bin").unwrap_err();
        assert!(matches!(err, UploadError::Io { .. }));
    }
}
