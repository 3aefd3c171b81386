//! Sequences built on the primitives: login, company catalog, entry posting
//! and the run over every company.

pub mod accounts;
pub mod catalog;
pub mod login;
pub mod posting;
pub mod run;

use std::time::Duration;

use crate::clock::Clock;
use crate::config::LayoutConfig;
use crate::dialog::DialogHandler;
use crate::error::{AutomationError, Result};
use crate::locator::WindowLocator;
use crate::matcher::{Affordance, MatchOptions, ScreenMatcher, TemplateLibrary};
use crate::primitives::wait_for_element;
use crate::surface::{ControlHandle, Pointer, ScreenCapture, UiSurface};

/// How long a step waits for the main window before giving up on the run.
pub const MAIN_WINDOW_WAIT: Duration = Duration::from_secs(30);
const MAIN_WINDOW_POLL: Duration = Duration::from_millis(500);

/// Everything a workflow step touches on the host.
#[derive(Clone, Copy)]
pub struct Desktop<'a> {
    pub ui: &'a dyn UiSurface,
    pub screen: &'a dyn ScreenCapture,
    pub pointer: &'a dyn Pointer,
    pub clock: &'a dyn Clock,
    pub templates: &'a TemplateLibrary,
    pub layout: &'a LayoutConfig,
}

impl<'a> Desktop<'a> {
    pub fn locator(&self) -> WindowLocator<'a> {
        WindowLocator::new(self.ui, self.clock)
    }

    pub fn matcher(&self) -> ScreenMatcher<'a> {
        ScreenMatcher::new(self.screen, self.pointer, self.clock, self.templates)
    }

    pub fn dialogs(&self) -> DialogHandler<'a> {
        DialogHandler::new(self.ui, self.clock, self.layout)
    }

    pub fn match_options(&self) -> MatchOptions {
        MatchOptions::from_layout(self.layout)
    }

    pub fn click_image(&self, affordance: Affordance) -> bool {
        self.matcher().find_and_click_image(affordance, &self.match_options())
    }

    /// Handle of the main application window once it is visible. Without it
    /// no company can be processed, so a miss is an environment error.
    pub fn main_window(&self, timeout: Duration) -> Result<ControlHandle> {
        let main = ControlHandle::title_prefix(&self.layout.main_title);
        wait_for_element(self.ui, self.clock, &main, timeout, MAIN_WINDOW_POLL)
            .map_err(|err| AutomationError::Environment(format!("main window not found: {err}")))?;
        Ok(main)
    }

    pub fn pause(&self, duration: Duration) {
        self.clock.sleep(duration);
    }
}
