//! Capabilities the engine consumes from the host: accessibility, screen
//! capture and pointer input. Handles are selectors, resolved again on every
//! call, so nothing is trusted across a window teardown.

use std::fmt;

use image::RgbImage;
use serde::Serialize;

use crate::error::{AutomationError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WindowSelector {
    Handle(u64),
    Title(String),
    TitlePrefix(String),
    TitleContains(String),
    Foreground,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ControlSelector {
    pub class_name: Option<String>,
    pub title: Option<String>,
    pub index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ControlHandle {
    pub window: WindowSelector,
    pub control: Option<ControlSelector>,
}

impl ControlHandle {
    pub fn window(selector: WindowSelector) -> Self {
        Self {
            window: selector,
            control: None,
        }
    }

    pub fn foreground() -> Self {
        Self::window(WindowSelector::Foreground)
    }

    pub fn titled(title: &str) -> Self {
        Self::window(WindowSelector::Title(title.to_string()))
    }

    pub fn title_prefix(prefix: &str) -> Self {
        Self::window(WindowSelector::TitlePrefix(prefix.to_string()))
    }

    pub fn title_contains(fragment: &str) -> Self {
        Self::window(WindowSelector::TitleContains(fragment.to_string()))
    }

    /// A child of this handle's window, matched by class and/or title.
    pub fn child(&self, class_name: Option<&str>, title: Option<&str>) -> Self {
        Self {
            window: self.window.clone(),
            control: Some(ControlSelector {
                class_name: class_name.map(ToString::to_string),
                title: title.map(ToString::to_string),
                index: 0,
            }),
        }
    }

    pub fn button(&self, title: &str) -> Self {
        self.child(Some("Button"), Some(title))
    }

    pub fn nth(mut self, index: usize) -> Self {
        if let Some(control) = self.control.as_mut() {
            control.index = index;
        }
        self
    }

    pub fn is_window(&self) -> bool {
        self.control.is_none()
    }
}

impl fmt::Display for ControlHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.window {
            WindowSelector::Handle(hwnd) => write!(f, "window#{hwnd:x}")?,
            WindowSelector::Title(t) => write!(f, "window '{t}'")?,
            WindowSelector::TitlePrefix(t) => write!(f, "window '{t}*'")?,
            WindowSelector::TitleContains(t) => write!(f, "window '*{t}*'")?,
            WindowSelector::Foreground => write!(f, "foreground window")?,
        }
        if let Some(control) = &self.control {
            write!(
                f,
                " / {}[{}]",
                control.class_name.as_deref().unwrap_or("*"),
                control.index
            )?;
            if let Some(title) = &control.title {
                write!(f, " '{title}'")?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowInfo {
    pub hwnd: u64,
    pub pid: u32,
    pub class_name: String,
    pub title: String,
}

impl WindowInfo {
    pub fn handle(&self) -> ControlHandle {
        ControlHandle::window(WindowSelector::Handle(self.hwnd))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlInfo {
    pub handle: ControlHandle,
    pub class_name: String,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Screen rectangle, right/bottom exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn from_origin(origin: Point, width: u32, height: u32) -> Self {
        Self::new(
            origin.x,
            origin.y,
            origin.x + width as i32,
            origin.y + height as i32,
        )
    }

    pub fn width(&self) -> u32 {
        (self.right - self.left).max(0) as u32
    }

    pub fn height(&self) -> u32 {
        (self.bottom - self.top).max(0) as u32
    }

    pub fn contains(&self, point: Point) -> bool {
        point.x >= self.left && point.x < self.right && point.y >= self.top && point.y < self.bottom
    }

    /// `point` taken relative to the top-left corner.
    pub fn offset(&self, point: Point) -> Point {
        Point::new(self.left + point.x, self.top + point.y)
    }
}

/// Accessibility layer of the target application.
pub trait UiSurface {
    fn exists(&self, target: &ControlHandle) -> Result<bool>;
    fn is_visible(&self, target: &ControlHandle) -> Result<bool>;
    fn is_enabled(&self, target: &ControlHandle) -> Result<bool>;
    fn click(&self, target: &ControlHandle) -> Result<()>;
    fn double_click(&self, target: &ControlHandle) -> Result<()>;
    /// Keystrokes use the `{TAB}`/`{ENTER}`/`^a` notation.
    fn type_text(&self, target: &ControlHandle, keys: &str) -> Result<()>;
    fn window_text(&self, target: &ControlHandle) -> Result<String>;
    fn children(
        &self,
        target: &ControlHandle,
        class_name: Option<&str>,
    ) -> Result<Vec<ControlInfo>>;
    /// `Some("")` enumerates untitled windows only.
    fn top_level_windows(&self, title: Option<&str>) -> Result<Vec<WindowInfo>>;
    fn foreground_window(&self) -> Result<Option<WindowInfo>>;
    fn focus(&self, target: &ControlHandle) -> Result<()>;
    fn maximize(&self, target: &ControlHandle) -> Result<()>;
    /// Screen rectangle of the target.
    fn bounds(&self, target: &ControlHandle) -> Result<Rect>;
    fn close(&self, target: &ControlHandle) -> Result<()>;
    fn list_rows(&self, target: &ControlHandle) -> Result<Vec<Vec<String>>>;
    fn activate_row(&self, target: &ControlHandle, row: usize) -> Result<()>;
    /// `path` uses `->` between menu levels, e.g. `Empresa->Cerrar empresa`.
    fn select_menu(&self, target: &ControlHandle, path: &str) -> Result<()>;
}

pub trait ScreenCapture {
    fn capture(&self) -> Result<RgbImage>;

    fn capture_region(&self, area: Rect) -> Result<RgbImage> {
        let full = self.capture()?;
        crop_region(&full, area)
    }
}

pub trait Pointer {
    fn click_at(&self, point: Point, double: bool) -> Result<()>;
}

pub fn crop_region(full: &RgbImage, area: Rect) -> Result<RgbImage> {
    let (width, height) = full.dimensions();
    let left = area.left.clamp(0, width as i32) as u32;
    let top = area.top.clamp(0, height as i32) as u32;
    let right = area.right.clamp(0, width as i32) as u32;
    let bottom = area.bottom.clamp(0, height as i32) as u32;
    if right <= left || bottom <= top {
        return Err(AutomationError::surface(format!(
            "capture area {area:?} lies outside the {width}x{height} screen"
        )));
    }
    Ok(image::imageops::crop_imm(full, left, top, right - left, bottom - top).to_image())
}
