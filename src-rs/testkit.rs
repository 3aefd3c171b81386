//! In-memory host for tests: a scripted desktop implementing the capability
//! traits, a manual clock, a process table and a data layer.
#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use image::{GrayImage, Luma, Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::clock::Clock;
use crate::data::{
    AccountCheck, AccountKind, CompanyRecord, DataAccess, DataError, DateRange, EntryRecord,
    ParameterCheck,
};
use crate::error::{AutomationError, Result};
use crate::lifecycle::{ProcessControl, ProcessError, ProcessInfo};
use crate::surface::{
    ControlHandle, ControlInfo, ControlSelector, Point, Pointer, Rect, ScreenCapture, UiSurface,
    WindowInfo, WindowSelector,
};

pub struct ManualClock {
    start: Instant,
    offset: Cell<Duration>,
    sleeps: RefCell<Vec<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            offset: Cell::new(Duration::ZERO),
            sleeps: RefCell::new(Vec::new()),
        }
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.borrow().clone()
    }

    pub fn elapsed(&self) -> Duration {
        self.offset.get()
    }

    pub fn advance(&self, by: Duration) {
        self.offset.set(self.offset.get() + by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.start + self.offset.get()
    }

    fn sleep(&self, duration: Duration) {
        self.sleeps.borrow_mut().push(duration);
        self.advance(duration);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Click { window: u64, control: String },
    DoubleClick { window: u64, control: String },
    Type { window: u64, control: String, keys: String },
    Focus(u64),
    Maximize(u64),
    Close(u64),
    ActivateRow { window: u64, row: usize },
    Menu { window: u64, path: String },
    PointerClick { point: Point, double: bool },
}

#[derive(Debug, Clone)]
pub struct FakeControl {
    pub class_name: String,
    pub text: String,
    pub visible: bool,
    pub enabled: bool,
    pub rows: Vec<Vec<String>>,
}

impl FakeControl {
    pub fn new(class_name: &str, text: &str) -> Self {
        Self {
            class_name: class_name.to_string(),
            text: text.to_string(),
            visible: true,
            enabled: true,
            rows: Vec::new(),
        }
    }

    pub fn list(rows: &[&[&str]]) -> Self {
        let mut control = Self::new("SysListView32", "");
        control.rows = rows
            .iter()
            .map(|row| row.iter().map(|cell| cell.to_string()).collect())
            .collect();
        control
    }
}

#[derive(Debug, Clone)]
pub struct FakeWindow {
    pub hwnd: u64,
    pub pid: u32,
    pub class_name: String,
    pub title: String,
    pub visible: bool,
    pub maximized: bool,
    pub bounds: Rect,
    pub controls: Vec<FakeControl>,
}

impl FakeWindow {
    pub fn control_mut(&mut self, text: &str) -> &mut FakeControl {
        let title = self.title.clone();
        self.controls
            .iter_mut()
            .find(|c| c.text == text)
            .unwrap_or_else(|| panic!("no control '{text}' in '{title}'"))
    }
}

type Reaction = Box<dyn FnMut(&Event, &mut DesktopState)>;

struct Scheduled {
    at: Duration,
    seq: u64,
    action: Box<dyn FnOnce(&mut DesktopState)>,
}

pub struct DesktopState {
    pub windows: Vec<FakeWindow>,
    pub foreground: Option<u64>,
    pub screen: RgbImage,
    pub now: Duration,
    next_hwnd: u64,
    next_seq: u64,
    scheduled: Vec<Scheduled>,
    log: Vec<Event>,
    reactions: Vec<Reaction>,
}

impl DesktopState {
    fn new() -> Self {
        Self {
            windows: Vec::new(),
            foreground: None,
            screen: RgbImage::from_pixel(200, 150, Rgb([128, 128, 128])),
            now: Duration::ZERO,
            next_hwnd: 0x100,
            next_seq: 0,
            scheduled: Vec::new(),
            log: Vec::new(),
            reactions: Vec::new(),
        }
    }

    /// Opens a window on top and gives it the focus.
    pub fn open_window(&mut self, title: &str, controls: Vec<FakeControl>) -> u64 {
        let hwnd = self.next_hwnd;
        self.next_hwnd += 1;
        self.windows.push(FakeWindow {
            hwnd,
            pid: 4242,
            class_name: "#32770".to_string(),
            title: title.to_string(),
            visible: true,
            maximized: false,
            bounds: Rect::new(0, 0, 200, 150),
            controls,
        });
        self.foreground = Some(hwnd);
        hwnd
    }

    pub fn close_window(&mut self, hwnd: u64) {
        self.windows.retain(|w| w.hwnd != hwnd);
        if self.foreground == Some(hwnd) {
            self.foreground = self.windows.iter().rev().find(|w| w.visible).map(|w| w.hwnd);
        }
    }

    pub fn close_titled(&mut self, title: &str) {
        let doomed: Vec<u64> =
            self.windows.iter().filter(|w| w.title == title).map(|w| w.hwnd).collect();
        for hwnd in doomed {
            self.close_window(hwnd);
        }
    }

    pub fn set_foreground(&mut self, hwnd: u64) {
        self.foreground = Some(hwnd);
    }

    pub fn window_mut(&mut self, hwnd: u64) -> &mut FakeWindow {
        self.windows
            .iter_mut()
            .find(|w| w.hwnd == hwnd)
            .unwrap_or_else(|| panic!("no window {hwnd:x}"))
    }

    pub fn window_by_title_mut(&mut self, title: &str) -> &mut FakeWindow {
        self.windows
            .iter_mut()
            .rev()
            .find(|w| w.title == title)
            .unwrap_or_else(|| panic!("no window '{title}'"))
    }

    pub fn has_window(&self, title: &str) -> bool {
        self.windows.iter().any(|w| w.title == title)
    }

    pub fn foreground_title(&self) -> Option<String> {
        let hwnd = self.foreground?;
        self.windows.iter().find(|w| w.hwnd == hwnd).map(|w| w.title.clone())
    }

    pub fn schedule_in(
        &mut self,
        delay: Duration,
        action: impl FnOnce(&mut DesktopState) + 'static,
    ) {
        let at = self.now + delay;
        self.schedule_at(at, action);
    }

    fn schedule_at(&mut self, at: Duration, action: impl FnOnce(&mut DesktopState) + 'static) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.scheduled.push(Scheduled {
            at,
            seq,
            action: Box::new(action),
        });
    }

    /// Runs `reaction` after every recorded event.
    pub fn on(&mut self, reaction: impl FnMut(&Event, &mut DesktopState) + 'static) {
        self.reactions.push(Box::new(reaction));
    }

    /// Runs `action` whenever the pointer clicks inside `area`.
    pub fn on_pointer(&mut self, area: Rect, mut action: impl FnMut(&mut DesktopState) + 'static) {
        self.on(move |event, state| {
            if let Event::PointerClick { point, .. } = event {
                if area.contains(*point) {
                    action(state);
                }
            }
        });
    }

    /// Runs `action` whenever a control with text `control` is clicked.
    pub fn on_click(
        &mut self,
        control: &str,
        mut action: impl FnMut(u64, &mut DesktopState) + 'static,
    ) {
        let control = control.to_string();
        self.on(move |event, state| {
            if let Event::Click { window, control: clicked } = event {
                if *clicked == control {
                    action(*window, state);
                }
            }
        });
    }

    pub fn events(&self) -> &[Event] {
        &self.log
    }

    pub fn paint(&mut self, template: &GrayImage, origin: Point) {
        for (x, y, pixel) in template.enumerate_pixels() {
            let (sx, sy) = (origin.x + x as i32, origin.y + y as i32);
            let (width, height) = self.screen.dimensions();
            if sx >= 0 && sy >= 0 && (sx as u32) < width && (sy as u32) < height {
                let v = pixel[0];
                self.screen.put_pixel(sx as u32, sy as u32, Rgb([v, v, v]));
            }
        }
    }

    /// Paints `template` and returns the area it covers.
    pub fn place(&mut self, template: &GrayImage, origin: Point) -> Rect {
        self.paint(template, origin);
        Rect::from_origin(origin, template.width(), template.height())
    }

    pub fn fill(&mut self, area: Rect, color: Rgb<u8>) {
        for y in area.top.max(0)..area.bottom.min(self.screen.height() as i32) {
            for x in area.left.max(0)..area.right.min(self.screen.width() as i32) {
                self.screen.put_pixel(x as u32, y as u32, color);
            }
        }
    }

    fn record(&mut self, event: Event) {
        self.log.push(event.clone());
        let mut reactions = std::mem::take(&mut self.reactions);
        for reaction in reactions.iter_mut() {
            reaction(&event, self);
        }
        reactions.append(&mut self.reactions);
        self.reactions = reactions;
    }

    fn window_matches(&self, window: &FakeWindow, selector: &WindowSelector) -> bool {
        match selector {
            WindowSelector::Handle(hwnd) => window.hwnd == *hwnd,
            WindowSelector::Title(title) => window.title == *title,
            WindowSelector::TitlePrefix(prefix) => window.title.starts_with(prefix.as_str()),
            WindowSelector::TitleContains(fragment) => window.title.contains(fragment.as_str()),
            WindowSelector::Foreground => self.foreground == Some(window.hwnd),
        }
    }

    fn resolve_window(&self, selector: &WindowSelector) -> Option<usize> {
        if let Some(fg) = self.foreground {
            if let Some(at) = self.windows.iter().position(|w| w.hwnd == fg) {
                if self.window_matches(&self.windows[at], selector) {
                    return Some(at);
                }
            }
        }
        self.windows.iter().rposition(|w| self.window_matches(w, selector))
    }

    fn resolve(&self, target: &ControlHandle) -> Option<(usize, Option<usize>)> {
        let window = self.resolve_window(&target.window)?;
        let Some(selector) = &target.control else {
            return Some((window, None));
        };
        let control = self.windows[window]
            .controls
            .iter()
            .enumerate()
            .filter(|(_, c)| selector_matches(selector, c))
            .nth(selector.index)
            .map(|(at, _)| at)?;
        Some((window, Some(control)))
    }

    fn require(&self, target: &ControlHandle) -> Result<(u64, String)> {
        let (window, control) = self
            .resolve(target)
            .ok_or_else(|| AutomationError::surface(format!("{target} not found")))?;
        let window = &self.windows[window];
        match control {
            None => Ok((window.hwnd, String::new())),
            Some(at) => {
                let control = &window.controls[at];
                if !control.enabled || !control.visible {
                    return Err(AutomationError::surface(format!("{target} is not actionable")));
                }
                Ok((window.hwnd, control.text.clone()))
            }
        }
    }

    fn info(window: &FakeWindow) -> WindowInfo {
        WindowInfo {
            hwnd: window.hwnd,
            pid: window.pid,
            class_name: window.class_name.clone(),
            title: window.title.clone(),
        }
    }
}

fn selector_matches(selector: &ControlSelector, control: &FakeControl) -> bool {
    selector
        .class_name
        .as_ref()
        .map_or(true, |class| control.class_name == *class)
        && selector.title.as_ref().map_or(true, |title| control.text == *title)
}

/// A desktop whose windows change only through the calls made on it, its
/// reactions and events scheduled on the shared manual clock.
pub struct ScriptedDesktop {
    clock: Rc<ManualClock>,
    state: RefCell<DesktopState>,
}

impl ScriptedDesktop {
    pub fn new(clock: Rc<ManualClock>) -> Self {
        Self {
            clock,
            state: RefCell::new(DesktopState::new()),
        }
    }

    pub fn open_window(&self, title: &str, controls: Vec<FakeControl>) -> u64 {
        self.edit(|state| state.open_window(title, controls))
    }

    pub fn edit<T>(&self, f: impl FnOnce(&mut DesktopState) -> T) -> T {
        self.tick();
        f(&mut *self.state.borrow_mut())
    }

    /// Schedules `action` at virtual time `at` since the clock started.
    pub fn at(&self, at: Duration, action: impl FnOnce(&mut DesktopState) + 'static) {
        self.state.borrow_mut().schedule_at(at, action);
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.borrow().log.clone()
    }

    fn tick(&self) {
        let now = self.clock.elapsed();
        let mut state = self.state.borrow_mut();
        state.now = now;
        loop {
            let due = state
                .scheduled
                .iter()
                .enumerate()
                .filter(|(_, s)| s.at <= now)
                .min_by_key(|(_, s)| (s.at, s.seq))
                .map(|(at, _)| at);
            let Some(due) = due else {
                break;
            };
            let scheduled = state.scheduled.remove(due);
            (scheduled.action)(&mut *state);
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut DesktopState) -> Result<T>) -> Result<T> {
        self.tick();
        f(&mut *self.state.borrow_mut())
    }
}

impl UiSurface for ScriptedDesktop {
    fn exists(&self, target: &ControlHandle) -> Result<bool> {
        self.with(|state| Ok(state.resolve(target).is_some()))
    }

    fn is_visible(&self, target: &ControlHandle) -> Result<bool> {
        self.with(|state| {
            Ok(match state.resolve(target) {
                None => false,
                Some((window, None)) => state.windows[window].visible,
                Some((window, Some(control))) => {
                    state.windows[window].visible && state.windows[window].controls[control].visible
                }
            })
        })
    }

    fn is_enabled(&self, target: &ControlHandle) -> Result<bool> {
        self.with(|state| {
            Ok(match state.resolve(target) {
                None => false,
                Some((_, None)) => true,
                Some((window, Some(control))) => state.windows[window].controls[control].enabled,
            })
        })
    }

    fn click(&self, target: &ControlHandle) -> Result<()> {
        self.with(|state| {
            let (window, control) = state.require(target)?;
            state.record(Event::Click { window, control });
            Ok(())
        })
    }

    fn double_click(&self, target: &ControlHandle) -> Result<()> {
        self.with(|state| {
            let (window, control) = state.require(target)?;
            state.record(Event::DoubleClick { window, control });
            Ok(())
        })
    }

    fn type_text(&self, target: &ControlHandle, keys: &str) -> Result<()> {
        self.with(|state| {
            let (window, control) = state.require(target)?;
            state.record(Event::Type {
                window,
                control,
                keys: keys.to_string(),
            });
            Ok(())
        })
    }

    fn window_text(&self, target: &ControlHandle) -> Result<String> {
        self.with(|state| match state.resolve(target) {
            None => Err(AutomationError::surface(format!("{target} not found"))),
            Some((window, None)) => Ok(state.windows[window].title.clone()),
            Some((window, Some(control))) => {
                Ok(state.windows[window].controls[control].text.clone())
            }
        })
    }

    fn children(
        &self,
        target: &ControlHandle,
        class_name: Option<&str>,
    ) -> Result<Vec<ControlInfo>> {
        self.with(|state| {
            let (window, control) = state
                .resolve(target)
                .ok_or_else(|| AutomationError::surface(format!("{target} not found")))?;
            if control.is_some() {
                return Ok(Vec::new());
            }
            let window = &state.windows[window];
            let mut per_class: HashMap<&str, usize> = HashMap::new();
            let mut out = Vec::new();
            for control in &window.controls {
                let index = per_class.entry(control.class_name.as_str()).or_insert(0);
                let this = *index;
                *index += 1;
                if class_name.is_some_and(|wanted| wanted != control.class_name) {
                    continue;
                }
                out.push(ControlInfo {
                    handle: ControlHandle {
                        window: WindowSelector::Handle(window.hwnd),
                        control: Some(ControlSelector {
                            class_name: Some(control.class_name.clone()),
                            title: None,
                            index: this,
                        }),
                    },
                    class_name: control.class_name.clone(),
                    text: control.text.clone(),
                });
            }
            Ok(out)
        })
    }

    fn top_level_windows(&self, title: Option<&str>) -> Result<Vec<WindowInfo>> {
        self.with(|state| {
            Ok(state
                .windows
                .iter()
                .filter(|w| w.visible)
                .filter(|w| title.map_or(true, |t| w.title == t))
                .map(DesktopState::info)
                .collect())
        })
    }

    fn foreground_window(&self) -> Result<Option<WindowInfo>> {
        self.with(|state| {
            Ok(state
                .foreground
                .and_then(|hwnd| state.windows.iter().find(|w| w.hwnd == hwnd))
                .map(DesktopState::info))
        })
    }

    fn focus(&self, target: &ControlHandle) -> Result<()> {
        self.with(|state| {
            let (window, _) = state.require(target)?;
            state.foreground = Some(window);
            state.record(Event::Focus(window));
            Ok(())
        })
    }

    fn maximize(&self, target: &ControlHandle) -> Result<()> {
        self.with(|state| {
            let (window, _) = state.require(target)?;
            state.window_mut(window).maximized = true;
            state.record(Event::Maximize(window));
            Ok(())
        })
    }

    fn close(&self, target: &ControlHandle) -> Result<()> {
        self.with(|state| {
            let (window, _) = state.require(target)?;
            state.close_window(window);
            state.record(Event::Close(window));
            Ok(())
        })
    }

    fn list_rows(&self, target: &ControlHandle) -> Result<Vec<Vec<String>>> {
        self.with(|state| match state.resolve(target) {
            Some((window, Some(control))) => {
                Ok(state.windows[window].controls[control].rows.clone())
            }
            _ => Err(AutomationError::surface(format!("{target} is not a list"))),
        })
    }

    fn activate_row(&self, target: &ControlHandle, row: usize) -> Result<()> {
        self.with(|state| {
            let rows = match state.resolve(target) {
                Some((window, Some(control))) => state.windows[window].controls[control].rows.len(),
                _ => return Err(AutomationError::surface(format!("{target} is not a list"))),
            };
            if row >= rows {
                return Err(AutomationError::surface(format!("row {row} out of range")));
            }
            let (window, _) = state.require(target)?;
            state.record(Event::ActivateRow { window, row });
            Ok(())
        })
    }

    fn bounds(&self, target: &ControlHandle) -> Result<Rect> {
        self.with(|state| {
            let (window, _) = state
                .resolve(target)
                .ok_or_else(|| AutomationError::surface(format!("{target} not found")))?;
            Ok(state.windows[window].bounds)
        })
    }

    fn select_menu(&self, target: &ControlHandle, path: &str) -> Result<()> {
        self.with(|state| {
            let (window, _) = state.require(target)?;
            state.record(Event::Menu {
                window,
                path: path.to_string(),
            });
            Ok(())
        })
    }
}

impl ScreenCapture for ScriptedDesktop {
    fn capture(&self) -> Result<RgbImage> {
        self.with(|state| Ok(state.screen.clone()))
    }
}

impl Pointer for ScriptedDesktop {
    fn click_at(&self, point: Point, double: bool) -> Result<()> {
        self.with(|state| {
            state.record(Event::PointerClick { point, double });
            Ok(())
        })
    }
}

pub fn noise_screen(width: u32, height: u32, seed: u64) -> RgbImage {
    let mut rng = StdRng::seed_from_u64(seed);
    RgbImage::from_fn(width, height, |_, _| Rgb([rng.gen(), rng.gen(), rng.gen()]))
}

/// Icon-like template made of 4x4 blocks of random gray levels.
pub fn blocky_template(width: u32, height: u32, seed: u64) -> GrayImage {
    let mut rng = StdRng::seed_from_u64(seed);
    let (bw, bh) = (width.div_ceil(4), height.div_ceil(4));
    let levels: Vec<u8> = (0..bw * bh).map(|_| rng.gen()).collect();
    GrayImage::from_fn(width, height, |x, y| Luma([levels[((y / 4) * bw + x / 4) as usize]]))
}

pub struct FakeProcesses {
    user: String,
    table: RefCell<Vec<(ProcessInfo, bool)>>,
    next_pid: Cell<u32>,
    spawned: RefCell<Vec<PathBuf>>,
    terminated: RefCell<Vec<u32>>,
    killed: RefCell<Vec<u32>>,
    stubborn: RefCell<Vec<u32>>,
    fail_spawns: Cell<bool>,
    spawn_hook: RefCell<Option<Box<dyn FnMut(u32)>>>,
}

impl FakeProcesses {
    pub fn new(user: &str) -> Self {
        Self {
            user: user.to_string(),
            table: RefCell::new(Vec::new()),
            next_pid: Cell::new(1000),
            spawned: RefCell::new(Vec::new()),
            terminated: RefCell::new(Vec::new()),
            killed: RefCell::new(Vec::new()),
            stubborn: RefCell::new(Vec::new()),
            fail_spawns: Cell::new(false),
            spawn_hook: RefCell::new(None),
        }
    }

    pub fn add(&self, name: &str, owner: Option<&str>) -> u32 {
        let pid = self.next_pid.get();
        self.next_pid.set(pid + 1);
        self.table.borrow_mut().push((
            ProcessInfo {
                pid,
                name: name.to_string(),
                owner: owner.map(ToString::to_string),
            },
            true,
        ));
        pid
    }

    pub fn on_spawn(&self, hook: impl FnMut(u32) + 'static) {
        *self.spawn_hook.borrow_mut() = Some(Box::new(hook));
    }

    pub fn fail_spawns(&self, fail: bool) {
        self.fail_spawns.set(fail);
    }

    pub fn ignore_terminate(&self, pid: u32) {
        self.stubborn.borrow_mut().push(pid);
    }

    pub fn spawned(&self) -> Vec<PathBuf> {
        self.spawned.borrow().clone()
    }

    pub fn terminated(&self) -> Vec<u32> {
        self.terminated.borrow().clone()
    }

    pub fn killed(&self) -> Vec<u32> {
        self.killed.borrow().clone()
    }

    fn mark_dead(&self, pid: u32) {
        for (process, alive) in self.table.borrow_mut().iter_mut() {
            if process.pid == pid {
                *alive = false;
            }
        }
    }
}

impl ProcessControl for FakeProcesses {
    fn list(&self) -> std::result::Result<Vec<ProcessInfo>, ProcessError> {
        Ok(self
            .table
            .borrow()
            .iter()
            .filter(|(_, alive)| *alive)
            .map(|(process, _)| process.clone())
            .collect())
    }

    fn current_user(&self) -> Option<String> {
        Some(self.user.clone())
    }

    fn spawn(&self, path: &Path) -> std::result::Result<u32, ProcessError> {
        if self.fail_spawns.get() {
            return Err(ProcessError::Failed(format!("cannot start {}", path.display())));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let pid = self.add(&name, Some(self.user.as_str()));
        self.spawned.borrow_mut().push(path.to_path_buf());
        let hook = self.spawn_hook.borrow_mut().take();
        if let Some(mut hook) = hook {
            hook(pid);
            *self.spawn_hook.borrow_mut() = Some(hook);
        }
        Ok(pid)
    }

    fn terminate(&self, pid: u32) -> std::result::Result<(), ProcessError> {
        if !self.is_alive(pid) {
            return Err(ProcessError::NotFound(pid));
        }
        self.terminated.borrow_mut().push(pid);
        if !self.stubborn.borrow().contains(&pid) {
            self.mark_dead(pid);
        }
        Ok(())
    }

    fn kill(&self, pid: u32) -> std::result::Result<(), ProcessError> {
        if !self.is_alive(pid) {
            return Err(ProcessError::NotFound(pid));
        }
        self.killed.borrow_mut().push(pid);
        self.mark_dead(pid);
        Ok(())
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.table
            .borrow()
            .iter()
            .any(|(process, alive)| process.pid == pid && *alive)
    }
}

/// Data layer backed by maps. Every call is recorded as `op:alias`.
#[derive(Default)]
pub struct FakeData {
    pub companies: Vec<CompanyRecord>,
    pub entries: HashMap<String, Vec<EntryRecord>>,
    pub accounts: HashMap<(String, AccountKind), AccountCheck>,
    pub parameters: HashMap<String, ParameterCheck>,
    pub ranges: HashMap<String, DateRange>,
    pub calls: RefCell<Vec<String>>,
}

impl FakeData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a company whose gates pass or fail as given.
    pub fn company(
        mut self,
        id: i64,
        name: &str,
        alias: &str,
        params_ok: bool,
        accounts_ok: bool,
    ) -> Self {
        self.companies.push(CompanyRecord {
            id,
            name: name.to_string(),
            database_alias: alias.to_string(),
        });
        self.parameters.insert(
            alias.to_string(),
            ParameterCheck {
                valid: params_ok,
                raw: String::new(),
            },
        );
        let codes = [
            (AccountKind::Client, "105-01-000"),
            (AccountKind::Supplier, "201-01-000"),
        ];
        for (kind, code) in codes {
            self.accounts.insert(
                (alias.to_string(), kind),
                AccountCheck {
                    code: Some(if accounts_ok {
                        code.to_string()
                    } else {
                        code.replace("000", "007")
                    }),
                    valid: accounts_ok,
                    message: String::new(),
                },
            );
        }
        if let (Some(first), Some(last)) = (
            NaiveDate::from_ymd_opt(2024, 3, 1),
            NaiveDate::from_ymd_opt(2024, 3, 31),
        ) {
            self.ranges.insert(alias.to_string(), DateRange { first, last });
        }
        self
    }

    pub fn entry(mut self, alias: &str, code: &str, name: &str) -> Self {
        self.entries.entry(alias.to_string()).or_default().push(EntryRecord {
            code: code.to_string(),
            name: name.to_string(),
            document_type: 1,
        });
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    fn note(&self, op: &str, alias: &str) {
        self.calls.borrow_mut().push(format!("{op}:{alias}"));
    }
}

impl DataAccess for FakeData {
    fn companies_for_user(&self, user: &str) -> std::result::Result<Vec<CompanyRecord>, DataError> {
        self.note("companies", user);
        Ok(self.companies.clone())
    }

    fn entries_for_database(
        &self,
        alias: &str,
    ) -> std::result::Result<Vec<EntryRecord>, DataError> {
        self.note("entries", alias);
        Ok(self.entries.get(alias).cloned().unwrap_or_default())
    }

    fn account_code_for_company(
        &self,
        alias: &str,
        kind: AccountKind,
    ) -> std::result::Result<AccountCheck, DataError> {
        self.note(kind.label(), alias);
        self.accounts
            .get(&(alias.to_string(), kind))
            .cloned()
            .ok_or_else(|| DataError::Missing(format!("{} account of {alias}", kind.label())))
    }

    fn validate_operating_parameters(
        &self,
        alias: &str,
    ) -> std::result::Result<ParameterCheck, DataError> {
        self.note("parameters", alias);
        self.parameters
            .get(alias)
            .cloned()
            .ok_or_else(|| DataError::Missing(format!("parameters of {alias}")))
    }

    fn date_range_for_company(&self, alias: &str) -> std::result::Result<DateRange, DataError> {
        self.note("range", alias);
        self.ranges
            .get(alias)
            .copied()
            .ok_or_else(|| DataError::Missing(format!("period of {alias}")))
    }
}
