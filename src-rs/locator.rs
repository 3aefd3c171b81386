//! Finds windows by title, by the text they show when they have no title, and
//! reads values next to labels. Controls in the target application expose no
//! semantic ids, so relative position is all there is.

use std::time::Duration;

use crate::clock::Clock;
use crate::primitives::poll_until;
use crate::surface::{ControlHandle, UiSurface};

pub const DETECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DETECT_INTERVAL: Duration = Duration::from_millis(100);
pub const DISAPPEAR_TIMEOUT: Duration = Duration::from_secs(5);
pub const DISAPPEAR_INTERVAL: Duration = Duration::from_millis(50);

/// Company segment of a main window title such as
/// `CONTPAQi® Contabilidad - Alpha SA - Ejercicio 2024`. An empty segment
/// yields `None`.
pub fn company_name_from_title(title: &str, main_title: &str) -> Option<String> {
    let title = title.trim();
    if !title.starts_with(main_title) {
        return None;
    }
    let parts: Vec<&str> = title.split(" - ").collect();
    if parts.len() < 3 {
        return None;
    }
    let name = parts[1].trim();
    (!name.is_empty()).then(|| name.to_string())
}

pub struct WindowLocator<'a> {
    ui: &'a dyn UiSurface,
    clock: &'a dyn Clock,
}

impl<'a> WindowLocator<'a> {
    pub fn new(ui: &'a dyn UiSurface, clock: &'a dyn Clock) -> Self {
        Self { ui, clock }
    }

    pub fn foreground_title(&self) -> Option<String> {
        match self.ui.foreground_window() {
            Ok(window) => window.map(|w| w.title),
            Err(err) => {
                log::error!("[locator] cannot read foreground window: {err}");
                None
            }
        }
    }

    pub fn is_top_window_with_title(&self, pattern: &str) -> bool {
        self.foreground_title()
            .is_some_and(|title| title.starts_with(pattern))
    }

    pub fn company_name(&self, main_title: &str) -> Option<String> {
        company_name_from_title(&self.foreground_title()?, main_title)
    }

    /// Text of the `index`-th child of `class_name` in `window`.
    pub fn control_text(
        &self,
        window: &ControlHandle,
        class_name: &str,
        index: usize,
    ) -> Option<String> {
        match self.ui.children(window, Some(class_name)) {
            Ok(children) => children.into_iter().nth(index).map(|c| c.text),
            Err(err) => {
                log::error!("[locator] cannot read {class_name}[{index}] of {window}: {err}");
                None
            }
        }
    }

    /// The static control `offset` positions after the one showing `text`.
    pub fn find_static_control_by_text(
        &self,
        window: &ControlHandle,
        text: &str,
        offset: usize,
    ) -> Option<ControlHandle> {
        let statics = match self.ui.children(window, Some("Static")) {
            Ok(statics) => statics,
            Err(err) => {
                log::error!("[locator] cannot list labels of {window}: {err}");
                return None;
            }
        };
        let at = statics.iter().position(|c| c.text == text)?;
        statics.get(at + offset).map(|c| c.handle.clone())
    }

    pub fn text_after_label(
        &self,
        window: &ControlHandle,
        label: &str,
        offset: usize,
    ) -> Option<String> {
        let handle = self.find_static_control_by_text(window, label, offset)?;
        self.ui.window_text(&handle).ok()
    }

    /// First untitled top-level window whose first label contains any of
    /// `content` and none of `ignore`, compared case-insensitively.
    pub fn detect_window_by_content(
        &self,
        content: &[&str],
        ignore: &[&str],
        timeout: Duration,
    ) -> Option<ControlHandle> {
        let content: Vec<String> = content.iter().map(|p| p.to_lowercase()).collect();
        let ignore: Vec<String> = ignore.iter().map(|p| p.to_lowercase()).collect();

        let found = poll_until(self.clock, timeout, DETECT_INTERVAL, || {
            let windows = match self.ui.top_level_windows(Some("")) {
                Ok(windows) => windows,
                Err(err) => {
                    log::warn!("[locator] cannot enumerate untitled windows: {err}");
                    return None;
                }
            };
            for window in windows {
                let handle = window.handle();
                let Some(text) = self.control_text(&handle, "Static", 0) else {
                    continue;
                };
                let lowered = text.to_lowercase();
                if lowered.is_empty() || ignore.iter().any(|p| lowered.contains(p.as_str())) {
                    continue;
                }
                if content.iter().any(|p| lowered.contains(p.as_str())) {
                    log::info!("[locator] window detected with content: {text}");
                    return Some(handle);
                }
            }
            None
        });
        if found.is_none() {
            log::warn!("[locator] no window with the expected content after {timeout:?}");
        }
        found
    }

    pub fn wait_for_window_disappearance(&self, window: &ControlHandle, timeout: Duration) -> bool {
        poll_until(self.clock, timeout, DISAPPEAR_INTERVAL, || {
            match self.ui.exists(window) {
                Ok(false) => Some(()),
                Ok(true) => None,
                Err(err) => {
                    log::debug!("[locator] existence check of {window} failed: {err}");
                    None
                }
            }
        })
        .is_some()
    }

    /// Closes a window whose title contains `fragment` if it shows up within
    /// `wait`. Returns whether one was closed.
    pub fn close_window_titled(&self, fragment: &str, wait: Duration, interval: Duration) -> bool {
        let handle = ControlHandle::title_contains(fragment);
        let present = poll_until(self.clock, wait, interval, || {
            self.ui.exists(&handle).ok().filter(|exists| *exists)
        });
        if present.is_none() {
            log::debug!("[locator] no '{fragment}' window");
            return false;
        }
        if let Err(err) = self.ui.focus(&handle).and_then(|_| self.ui.close(&handle)) {
            log::error!("[locator] cannot close '{fragment}' window: {err}");
            return false;
        }
        log::debug!("[locator] closed '{fragment}' window");
        true
    }
}
