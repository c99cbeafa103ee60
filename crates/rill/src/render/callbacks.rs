use tracing::error;

use super::types::{ErrorInfo, PostponeInfo, format_key_path};
use crate::config::RenderConfig;
use crate::error::RillError;
use crate::wire_format::WireFormat;

pub type ShellReadyCallback = Box<dyn FnOnce() + Send>;
pub type ShellErrorCallback = Box<dyn FnOnce(&RillError) + Send>;
pub type AllReadyCallback = Box<dyn FnOnce() + Send>;
pub type ErrorCallback = Box<dyn FnMut(&RillError, &ErrorInfo) -> Option<String> + Send>;
pub type PostponeCallback = Box<dyn FnMut(&str, &PostponeInfo) + Send>;

/// Everything a caller can customise about one render.
#[derive(Default)]
pub struct RenderOptions {
    pub config: RenderConfig,
    pub format: Option<Box<dyn WireFormat>>,
    pub on_shell_ready: Option<ShellReadyCallback>,
    pub on_shell_error: Option<ShellErrorCallback>,
    pub on_all_ready: Option<AllReadyCallback>,
    pub on_error: Option<ErrorCallback>,
    pub on_postpone: Option<PostponeCallback>,
}

impl std::fmt::Debug for RenderOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderOptions")
            .field("config", &self.config)
            .field("custom_format", &self.format.is_some())
            .field("on_shell_ready", &self.on_shell_ready.is_some())
            .field("on_shell_error", &self.on_shell_error.is_some())
            .field("on_all_ready", &self.on_all_ready.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_postpone", &self.on_postpone.is_some())
            .finish()
    }
}

impl RenderOptions {
    pub fn new(config: RenderConfig) -> Self {
        Self { config, ..Self::default() }
    }

    pub fn with_format(mut self, format: impl WireFormat + 'static) -> Self {
        self.format = Some(Box::new(format));
        self
    }

    pub fn on_shell_ready(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_shell_ready = Some(Box::new(callback));
        self
    }

    pub fn on_shell_error(mut self, callback: impl FnOnce(&RillError) + Send + 'static) -> Self {
        self.on_shell_error = Some(Box::new(callback));
        self
    }

    pub fn on_all_ready(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_all_ready = Some(Box::new(callback));
        self
    }

    /// The returned string, if any, becomes the digest carried by the
    /// client-render marker of the affected boundary.
    pub fn on_error(
        mut self,
        callback: impl FnMut(&RillError, &ErrorInfo) -> Option<String> + Send + 'static,
    ) -> Self {
        self.on_error = Some(Box::new(callback));
        self
    }

    pub fn on_postpone(mut self, callback: impl FnMut(&str, &PostponeInfo) + Send + 'static) -> Self {
        self.on_postpone = Some(Box::new(callback));
        self
    }
}

/// The callback half of [`RenderOptions`], owned by a Request.
#[derive(Default)]
pub(crate) struct Callbacks {
    on_shell_ready: Option<ShellReadyCallback>,
    on_shell_error: Option<ShellErrorCallback>,
    on_all_ready: Option<AllReadyCallback>,
    on_error: Option<ErrorCallback>,
    on_postpone: Option<PostponeCallback>,
}

impl Callbacks {
    pub(crate) fn split(options: RenderOptions) -> (RenderConfig, Option<Box<dyn WireFormat>>, Self) {
        let RenderOptions {
            config,
            format,
            on_shell_ready,
            on_shell_error,
            on_all_ready,
            on_error,
            on_postpone,
        } = options;

        (
            config,
            format,
            Self { on_shell_ready, on_shell_error, on_all_ready, on_error, on_postpone },
        )
    }

    pub(crate) fn shell_ready(&mut self) {
        if let Some(callback) = self.on_shell_ready.take() {
            callback();
        }
    }

    pub(crate) fn shell_error(&mut self, error: &RillError) {
        if let Some(callback) = self.on_shell_error.take() {
            callback(error);
        }
        self.on_shell_ready = None;
    }

    pub(crate) fn all_ready(&mut self) {
        if let Some(callback) = self.on_all_ready.take() {
            callback();
        }
    }

    pub(crate) fn error(&mut self, error: &RillError, info: &ErrorInfo) -> Option<String> {
        match self.on_error.as_mut() {
            Some(callback) => callback(error, info),
            None => {
                error!(
                    "Render error at {} (boundary {:?}): {}",
                    format_key_path(&info.key_path),
                    info.boundary_id,
                    error
                );
                None
            }
        }
    }

    pub(crate) fn postpone(&mut self, reason: &str, info: &PostponeInfo) {
        if let Some(callback) = self.on_postpone.as_mut() {
            callback(reason, info);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::types::KeyPath;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_once_callbacks_fire_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let options = RenderOptions::default().on_shell_ready(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let (_, _, mut callbacks) = Callbacks::split(options);
        callbacks.shell_ready();
        callbacks.shell_ready();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shell_error_disarms_shell_ready() {
        let ready = Arc::new(AtomicUsize::new(0));
        let ready_counter = Arc::clone(&ready);
        let options = RenderOptions::default()
            .on_shell_ready(move || {
                ready_counter.fetch_add(1, Ordering::SeqCst);
            })
            .on_shell_error(|_| {});

        let (_, _, mut callbacks) = Callbacks::split(options);
        callbacks.shell_error(&RillError::render("boom"));
        callbacks.shell_ready();

        assert_eq!(ready.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_error_callback_supplies_digest() {
        let options = RenderOptions::default().on_error(|error, info| {
            Some(format!("{}@{}", error.message(), format_key_path(&info.key_path)))
        });

        let (_, _, mut callbacks) = Callbacks::split(options);
        let info = ErrorInfo {
            boundary_id: Some(1),
            key_path: KeyPath::from_slice(&[0, 2]),
            environment_name: "Server".to_string(),
        };

        assert_eq!(callbacks.error(&RillError::render("bad"), &info).as_deref(), Some("bad@0.2"));
    }

    #[test]
    fn test_default_error_callback_has_no_digest() {
        let (_, _, mut callbacks) = Callbacks::split(RenderOptions::default());
        let info = ErrorInfo {
            boundary_id: None,
            key_path: KeyPath::new(),
            environment_name: "Server".to_string(),
        };

        assert!(callbacks.error(&RillError::render("bad"), &info).is_none());
    }
}
