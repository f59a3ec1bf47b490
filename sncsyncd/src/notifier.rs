use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};
use zbus::Connection;

use crate::sync::paths::SyncCoordinate;

const APP_NAME: &str = "sncsyncd";
const EXPIRE_MS: i32 = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotifyCode {
    UploadComplete,
    UploadError,
    ReceivedFile,
    ReceivedFileError,
    ReceivedEmpty,
    RecordNotFound,
    NotInSync,
    ComplexError,
    /// Content was transferred but its fingerprint could not be stored.
    SyncStateError,
    AllDownloadsComplete,
    DownloadsFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyKind {
    Pass,
    Fail,
    Info,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotifyContext {
    pub table: String,
    pub file: String,
    pub field: String,
}

impl From<&SyncCoordinate> for NotifyContext {
    fn from(coordinate: &SyncCoordinate) -> Self {
        Self {
            table: coordinate.table.clone(),
            file: coordinate.key_value.clone(),
            field: coordinate.field.clone(),
        }
    }
}

/// Rendered text of one notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub kind: NotifyKind,
    pub title: &'static str,
    pub subtitle: String,
    pub message: String,
}

impl NotifyCode {
    pub fn kind(self) -> NotifyKind {
        match self {
            NotifyCode::UploadComplete
            | NotifyCode::ReceivedFile
            | NotifyCode::AllDownloadsComplete => NotifyKind::Pass,
            NotifyCode::ReceivedEmpty => NotifyKind::Info,
            _ => NotifyKind::Fail,
        }
    }

    pub fn render(self, context: &NotifyContext) -> Rendered {
        let target = format!("{} ({}:{})", context.file, context.table, context.field);
        let (title, subtitle, message) = match self {
            NotifyCode::UploadComplete => ("Upload Complete", context.file.clone(), target),
            NotifyCode::UploadError => ("Failed to Upload file", String::new(), target),
            NotifyCode::ReceivedFile => ("Download Complete", String::new(), target),
            NotifyCode::ReceivedFileError => ("Failed to Download file", String::new(), target),
            NotifyCode::ReceivedEmpty => (
                "Record field has no data!",
                "Please add some content to your new file.".to_string(),
                target,
            ),
            NotifyCode::RecordNotFound => ("Could not find record", String::new(), target),
            NotifyCode::NotInSync => (
                "File not in sync!",
                "Please update your local version first!".to_string(),
                target,
            ),
            NotifyCode::ComplexError => (
                "Connection Error",
                String::new(),
                "Please see command line output for details.".to_string(),
            ),
            NotifyCode::SyncStateError => (
                "Sync data not saved!",
                "Conflict detection for this file is unreliable.".to_string(),
                target,
            ),
            NotifyCode::AllDownloadsComplete => (
                "Downloads Complete",
                String::new(),
                "All files were received.".to_string(),
            ),
            NotifyCode::DownloadsFailed => (
                "Some downloads failed",
                String::new(),
                "Please see command line output for details.".to_string(),
            ),
        };
        Rendered {
            kind: self.kind(),
            title,
            subtitle,
            message,
        }
    }
}

/// User-facing signal sink. Must return promptly and never fail into the caller.
pub trait Notifier: Send + Sync {
    fn notify(&self, code: NotifyCode, context: &NotifyContext);
}

fn log_rendered(code: NotifyCode, rendered: &Rendered) {
    match code {
        NotifyCode::SyncStateError => error!(
            title = rendered.title,
            subtitle = %rendered.subtitle,
            message = %rendered.message,
            "notification"
        ),
        _ if rendered.kind == NotifyKind::Fail => warn!(
            title = rendered.title,
            subtitle = %rendered.subtitle,
            message = %rendered.message,
            "notification"
        ),
        _ => info!(
            title = rendered.title,
            subtitle = %rendered.subtitle,
            message = %rendered.message,
            "notification"
        ),
    }
}

#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, code: NotifyCode, context: &NotifyContext) {
        log_rendered(code, &code.render(context));
    }
}

/// Logs and forwards to `org.freedesktop.Notifications` on the session bus.
#[derive(Clone, Default)]
pub struct DesktopNotifier {
    connection: Arc<OnceCell<Option<Connection>>>,
}

impl DesktopNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    async fn send(&self, rendered: Rendered) -> zbus::Result<()> {
        let connection = self
            .connection
            .get_or_init(|| async {
                match Connection::session().await {
                    Ok(connection) => Some(connection),
                    Err(err) => {
                        warn!(error = %err, "desktop notifications unavailable");
                        None
                    }
                }
            })
            .await;
        let Some(connection) = connection else {
            return Ok(());
        };
        let summary = if rendered.subtitle.is_empty() {
            rendered.title.to_string()
        } else {
            format!("{}: {}", rendered.title, rendered.subtitle)
        };
        let icon = match rendered.kind {
            NotifyKind::Pass => "dialog-information",
            NotifyKind::Fail => "dialog-error",
            NotifyKind::Info => "dialog-warning",
        };
        let actions: Vec<&str> = Vec::new();
        let hints: HashMap<&str, zbus::zvariant::Value<'_>> = HashMap::new();
        connection
            .call_method(
                Some("org.freedesktop.Notifications"),
                "/org/freedesktop/Notifications",
                Some("org.freedesktop.Notifications"),
                "Notify",
                &(
                    APP_NAME,
                    0u32,
                    icon,
                    summary.as_str(),
                    rendered.message.as_str(),
                    actions,
                    hints,
                    EXPIRE_MS,
                ),
            )
            .await?;
        Ok(())
    }
}

impl Notifier for DesktopNotifier {
    fn notify(&self, code: NotifyCode, context: &NotifyContext) {
        let rendered = code.render(context);
        log_rendered(code, &rendered);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let this = self.clone();
        runtime.spawn(async move {
            if let Err(err) = this.send(rendered).await {
                debug!(error = %err, "desktop notification failed");
            }
        });
    }
}
