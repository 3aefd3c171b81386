//! Per-entry posting in the `Contabilizar CFDI` window: entry code, document
//! filters, association, reference-data updates and policy generation.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use image::Rgb;
use serde::Serialize;

use crate::clock::secs;
use crate::config::{EntryTemplate, FilterValue, RunConfig};
use crate::data::{DataAccess, EntryRecord};
use crate::dialog::{DialogOutcome, ACCEPT, UNBALANCED_ENTRY};
use crate::error::{AutomationError, Result};
use crate::locator::{DETECT_TIMEOUT, DISAPPEAR_TIMEOUT};
use crate::matcher::Affordance;
use crate::primitives::{
    poll_until, retry_action, verify_element_state, wait_for_element, RetryPolicy,
};
use crate::surface::ControlHandle;

use super::accounts::{AccountResolver, FORWARD, GENERATE};
use super::{Desktop, MAIN_WINDOW_WAIT};

pub const WINDOW_SEARCH: Duration = Duration::from_secs(10);
pub const WINDOW_SEARCH_POLL: Duration = Duration::from_millis(200);
pub const READY_WAIT: Duration = Duration::from_secs(30);
pub const XML_TITLE: &str = "XML";
pub const XML_WAIT: Duration = Duration::from_secs(10);
pub const COMMIT_SETTLE: Duration = Duration::from_secs(5);
pub const MESSAGE_TITLE: &str = "Mensaje";
pub const READING_DOCUMENTS: &str = "Leyendo documentos ";
pub const GENERATING: &str = "Generando asientos contables, espere...";
pub const SEARCH_IGNORE: &str = "Buscar";
pub const RESOLUTION_ITERATIONS: u32 = 200;
pub const RESOLUTION_POLL: Duration = Duration::from_millis(200);
pub const READINESS_POLLS: u32 = 200;
pub const READINESS_POLL: Duration = Duration::from_millis(50);
pub const GENERATION_TRIES: u32 = 3;
pub const PROBLEM_TITLE: &str = "Problema";
pub const PROBLEM_WATCH: Duration = Duration::from_secs(3);
pub const PROBLEM_POLL: Duration = Duration::from_millis(500);
pub const RESULT_WAIT: Duration = Duration::from_secs(30);
pub const RESULT_POLL: Duration = Duration::from_secs(1);
pub const POLICY_CREATED: &str = "Póliza creada";
/// The double space is what the application prints.
pub const POLICY_REJECTED: &str = "No se puede guardar el movimiento de la  póliza por que la";

const POLL: Duration = Duration::from_millis(500);
const MESSAGE_WAIT: Duration = Duration::from_secs(1);
const MESSAGE_POLL: Duration = Duration::from_millis(100);
const STAGE_REPEAT_LIMIT: u32 = 8;
const DATE_FILTERS: [&str; 2] = ["firstDate", "lastDate"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    ClientUpdate,
    SupplierUpdate,
    ProductUpdate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum ProcessingState {
    NotStarted,
    Filtering,
    Associating,
    AwaitingResolution(UpdateKind),
    PolicyGeneration,
    Done,
    Failed(String),
}

impl ProcessingState {
    fn rank(&self) -> u8 {
        match self {
            Self::NotStarted => 0,
            Self::Filtering => 1,
            Self::Associating => 2,
            Self::AwaitingResolution(_) => 3,
            Self::PolicyGeneration => 4,
            Self::Done | Self::Failed(_) => 5,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed(_))
    }

    /// Stages with an internal retry loop.
    fn repeatable(&self) -> bool {
        matches!(self, Self::AwaitingResolution(_) | Self::PolicyGeneration)
    }
}

/// Forward-only progression of one entry. Resolution and generation may be
/// re-entered up to a limit, after which the entry is failed.
#[derive(Debug, Clone)]
pub struct EntryProgress {
    state: ProcessingState,
    repeats: u32,
    limit: u32,
}

impl EntryProgress {
    pub fn new(limit: u32) -> Self {
        Self {
            state: ProcessingState::NotStarted,
            repeats: 0,
            limit,
        }
    }

    pub fn state(&self) -> &ProcessingState {
        &self.state
    }

    pub fn advance(&mut self, next: ProcessingState) -> Result<()> {
        let backwards =
            !matches!(next, ProcessingState::Failed(_)) && next.rank() < self.state.rank();
        let stalled = next.rank() == self.state.rank() && !self.state.repeatable();
        if self.state.is_terminal() || backwards || stalled {
            return Err(AutomationError::Transition {
                from: self.state.clone(),
                to: next,
            });
        }
        if next.rank() == self.state.rank() {
            self.repeats += 1;
            if self.repeats > self.limit {
                let last = format!("{next:?} re-entered {} times", self.repeats);
                self.state = ProcessingState::Failed(last.clone());
                return Err(AutomationError::Exhausted {
                    attempts: self.repeats,
                    last,
                });
            }
        } else {
            self.repeats = 0;
        }
        log::debug!("[posting] {:?} -> {next:?}", self.state);
        self.state = next;
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        if !self.state.is_terminal() {
            self.state = ProcessingState::Failed(reason.into());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum EntryOutcome {
    Posted,
    NoDocuments,
    /// The debit/credit mismatch was acknowledged; the run moves on.
    UnbalancedEntry,
    SkippedNoTemplate,
    Failed(String),
}

impl EntryOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryReport {
    pub code: String,
    pub name: String,
    pub outcome: EntryOutcome,
    pub state: ProcessingState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Generation {
    Created,
    Rejected,
    NotCreated,
    Unbalanced,
    Problem(String),
}

/// SendKeys treats these as modifiers or grouping.
pub fn escape_keys(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(ch, '+' | '^' | '%' | '~' | '(' | ')' | '{' | '}' | '[' | ']') {
            out.push('{');
            out.push(ch);
            out.push('}');
        } else {
            out.push(ch);
        }
    }
    out
}

fn tabs(count: u32) -> String {
    "{TAB}".repeat(count as usize)
}

/// Keystrokes for the filter window: the date range, then every configured
/// filter in tab-stop order. List values take two stops per value.
pub fn filter_keystrokes(
    first: &str,
    last: &str,
    template: &EntryTemplate,
    positions: &BTreeMap<String, u32>,
    first_stop: u32,
) -> Vec<String> {
    let mut keys = vec![
        "^a".to_string(),
        "{BACKSPACE}".to_string(),
        format!("{first}{{TAB}}"),
        "^a".to_string(),
        "{BACKSPACE}".to_string(),
        format!("{last}{{ENTER}}"),
    ];
    if first_stop > 0 {
        keys.push(tabs(first_stop));
    }

    let mut placed: Vec<(u32, &str, &FilterValue)> = template
        .filters
        .iter()
        .filter(|(name, _)| !DATE_FILTERS.contains(&name.as_str()))
        .filter_map(|(name, value)| match positions.get(name) {
            Some(position) => Some((*position, name.as_str(), value)),
            None => {
                log::warn!("[posting] filter '{name}' has no tab position; skipped");
                None
            }
        })
        .collect();
    placed.sort_by_key(|&(position, name, _)| (position, name));

    let mut current = first_stop;
    for (position, name, value) in placed {
        let gap = position.saturating_sub(current);
        if gap > 0 {
            keys.push(tabs(gap));
        }
        current = position;
        match value {
            FilterValue::Many(values) => {
                for item in values.iter().map(|v| v.trim()).filter(|v| !v.is_empty()) {
                    keys.push(escape_keys(item));
                    keys.push("{TAB}{TAB}".to_string());
                }
            }
            other => match other.single() {
                Some(item) => {
                    keys.push(escape_keys(item));
                    keys.push("{TAB}".to_string());
                }
                None => {
                    log::debug!("[posting] empty filter '{name}'");
                    keys.push("{TAB}".to_string());
                }
            },
        }
        current += 1;
    }
    keys
}

/// Opens the posting window from the main window toolbar and returns a handle
/// bound to its window id.
pub fn open_posting_window(desktop: &Desktop<'_>) -> Result<ControlHandle> {
    desktop.main_window(MAIN_WINDOW_WAIT)?;

    let policy = RetryPolicy {
        max_retries: 3,
        ..RetryPolicy::default()
    };
    retry_action(desktop.clock, policy, |_| {
        if !desktop.click_image(Affordance::PostingWindow) {
            return Err("posting window button not found");
        }
        desktop.pause(Duration::from_secs(1));
        Ok(())
    })?;

    let title = desktop.layout.posting_title.as_str();
    let found = poll_until(desktop.clock, WINDOW_SEARCH, WINDOW_SEARCH_POLL, || {
        match desktop.ui.top_level_windows(None) {
            Ok(windows) => windows.into_iter().find(|w| w.title.contains(title)),
            Err(err) => {
                log::debug!("[posting] window search failed: {err}");
                None
            }
        }
    });
    let Some(window) = found else {
        log::error!("[posting] no '{title}' window after {WINDOW_SEARCH:?}");
        return Err(AutomationError::timeout(format!("window '{title}'"), WINDOW_SEARCH));
    };
    log::debug!("[posting] posting window found: {:x}", window.hwnd);
    let handle = window.handle();
    wait_for_element(desktop.ui, desktop.clock, &handle, READY_WAIT, POLL)?;
    desktop.ui.maximize(&handle)?;
    Ok(handle)
}

pub struct PostingSession<'a> {
    desktop: Desktop<'a>,
    data: &'a dyn DataAccess,
    config: &'a RunConfig,
    window: ControlHandle,
}

impl<'a> PostingSession<'a> {
    pub fn new(
        desktop: Desktop<'a>,
        data: &'a dyn DataAccess,
        config: &'a RunConfig,
        window: ControlHandle,
    ) -> Self {
        Self {
            desktop,
            data,
            config,
            window,
        }
    }

    pub fn window(&self) -> &ControlHandle {
        &self.window
    }

    pub fn process_entry(&self, entry: &EntryRecord, company: &str, alias: &str) -> EntryReport {
        log::info!("[posting] entry {} ({})", entry.code, entry.name);
        let mut progress = EntryProgress::new(STAGE_REPEAT_LIMIT);
        let outcome = match self.config.template(company, &entry.code) {
            None => {
                log::warn!("[posting] no template for entry {} of {company}", entry.code);
                EntryOutcome::SkippedNoTemplate
            }
            Some(template) => self
                .post(entry, template, alias, &mut progress)
                .unwrap_or_else(|err| {
                    log::error!("[posting] entry {} failed: {err}", entry.code);
                    EntryOutcome::Failed(err.to_string())
                }),
        };
        match &outcome {
            EntryOutcome::Failed(reason) => progress.fail(reason.clone()),
            _ => {
                if let Err(err) = progress.advance(ProcessingState::Done) {
                    log::debug!("[posting] {err}");
                }
            }
        }
        log::info!("[posting] entry {}: {outcome:?}", entry.code);
        EntryReport {
            code: entry.code.clone(),
            name: entry.name.clone(),
            outcome,
            state: progress.state().clone(),
        }
    }

    fn post(
        &self,
        entry: &EntryRecord,
        template: &EntryTemplate,
        alias: &str,
        progress: &mut EntryProgress,
    ) -> Result<EntryOutcome> {
        let ui = self.desktop.ui;
        progress.advance(ProcessingState::Filtering)?;

        let code_field = self.window.child(Some("Edit"), None);
        ui.focus(&code_field)?;
        ui.type_text(&code_field, &entry.code)?;
        self.desktop.pause(secs(0.2));

        ui.focus(&self.window)?;
        if !self.desktop.click_image(Affordance::SelectDocuments) {
            return Err(AutomationError::ControlMissing("document selection button".to_string()));
        }
        let xml = ControlHandle::title_contains(XML_TITLE);
        wait_for_element(ui, self.desktop.clock, &xml, XML_WAIT, POLL)?;

        if template.filters.is_empty() {
            return Ok(EntryOutcome::Failed(format!("template {} has no filters", entry.code)));
        }
        let (first, last) = match template.date_override() {
            Some(range) => range,
            None => {
                let range = self.data.date_range_for_company(alias)?;
                (range.first_text(), range.last_text())
            }
        };
        log::debug!("[posting] document dates {first} - {last}");
        let empty = BTreeMap::new();
        let positions = self
            .config
            .positions_for(&template.document_type)
            .unwrap_or(&empty);
        let first_stop = self.desktop.layout.first_filter_stop;
        let keys = filter_keystrokes(&first, &last, template, positions, first_stop);
        self.apply_filters(&xml, &keys)?;

        progress.advance(ProcessingState::Associating)?;
        if !self.associate() {
            return Ok(EntryOutcome::NoDocuments);
        }

        self.resolve_updates(alias, progress)?;
        if !self.generation_reached() {
            log::error!("[posting] posting screen never reached for entry {}", entry.code);
            return Ok(EntryOutcome::Failed("posting screen not reached".to_string()));
        }
        self.generate_policies(progress)
    }

    fn apply_filters(&self, xml: &ControlHandle, keys: &[String]) -> Result<()> {
        let ui = self.desktop.ui;
        self.desktop.pause(secs(0.5));
        for key in keys {
            ui.type_text(xml, key)?;
        }
        ui.type_text(xml, "{ENTER}")?;
        self.desktop.pause(COMMIT_SETTLE);
        let commit = ui.bounds(xml)?.offset(self.desktop.layout.filter_commit_point());
        self.desktop.pointer.click_at(commit, false)?;
        ui.type_text(xml, "^a")
    }

    /// Associates the filtered documents. Returns `false` when the application
    /// reports there is nothing to associate.
    fn associate(&self) -> bool {
        let desktop = &self.desktop;
        desktop.pause(secs(0.5));
        if !desktop.click_image(Affordance::Associate) {
            log::error!("[posting] associate button not found");
        }
        if !desktop.click_image(Affordance::Yes) {
            log::error!("[posting] confirmation button not found");
        }

        let locator = desktop.locator();
        if locator.close_window_titled(MESSAGE_TITLE, MESSAGE_WAIT, MESSAGE_POLL) {
            log::info!("[posting] no documents to post");
            if !desktop.click_image(Affordance::Close) {
                log::error!("[posting] close button not found");
            }
            return false;
        }

        let layout = desktop.layout;
        let [r, g, b] = layout.association_color;
        let done = desktop.matcher().wait_for_colors(
            &[Rgb([r, g, b])],
            layout.association_rect(),
            layout.color_tolerance,
            layout.color_attempts,
            Duration::from_millis(layout.color_interval_ms),
        );
        if done {
            if !desktop.click_image(Affordance::Close) {
                log::error!("[posting] close button not found");
            }
        } else {
            log::error!("[posting] association did not complete in time");
        }

        let reading = locator.detect_window_by_content(
            &[READING_DOCUMENTS],
            &[SEARCH_IGNORE],
            DETECT_TIMEOUT,
        );
        if let Some(reading) = reading {
            if !locator.wait_for_window_disappearance(&reading, DISAPPEAR_TIMEOUT) {
                log::debug!("[posting] document reading still running");
            }
        }
        true
    }

    fn visible(&self, target: &ControlHandle) -> bool {
        let ui = self.desktop.ui;
        ui.exists(target).unwrap_or(false) && ui.is_visible(target).unwrap_or(false)
    }

    fn generation_reached(&self) -> bool {
        self.visible(&self.window.button(GENERATE))
    }

    fn resolve_updates(&self, alias: &str, progress: &mut EntryProgress) -> Result<()> {
        let resolver = AccountResolver::new(self.desktop, self.data, self.window.clone(), alias);
        let mut done: HashSet<UpdateKind> = HashSet::new();
        for iteration in 1..=RESOLUTION_ITERATIONS {
            if self.generation_reached() {
                log::info!("[posting] posting screen reached after {iteration} cycles");
                return Ok(());
            }
            let pending = UpdateKind::ALL
                .into_iter()
                .filter(|kind| !done.contains(kind))
                .find(|kind| self.visible(&self.window.button(kind.button_title())));
            match pending {
                Some(kind) => {
                    progress.advance(ProcessingState::AwaitingResolution(kind))?;
                    if let Err(err) = resolver.resolve(kind) {
                        log::error!("[posting] '{}' failed: {err}", kind.button_title());
                    }
                    done.insert(kind);
                }
                None => {
                    let forward = self.window.button(FORWARD);
                    if self.visible(&forward) {
                        log::info!("[posting] no update pending; advancing");
                        self.desktop.ui.click(&forward)?;
                    }
                    self.desktop.pause(RESOLUTION_POLL);
                }
            }
        }
        Ok(())
    }

    fn generate_policies(&self, progress: &mut EntryProgress) -> Result<EntryOutcome> {
        let desktop = &self.desktop;
        let generate = self.window.button(GENERATE);
        let locator = desktop.locator();
        let mut tries = 0;

        for _ in 0..READINESS_POLLS {
            let ready = verify_element_state(
                desktop.ui,
                desktop.clock,
                &generate,
                Duration::ZERO,
                READINESS_POLL,
            );
            if ready {
                let busy = locator.detect_window_by_content(
                    &[GENERATING],
                    &[SEARCH_IGNORE],
                    DETECT_TIMEOUT,
                );
                if let Some(busy) = busy {
                    log::debug!("[posting] waiting for entries to be generated");
                    locator.wait_for_window_disappearance(&busy, DISAPPEAR_TIMEOUT);
                }
                tries += 1;
                progress.advance(ProcessingState::PolicyGeneration)?;
                match self.try_generate(&generate)? {
                    Generation::Created => {
                        log::info!("[posting] policy created");
                        desktop.pause(secs(0.5));
                        self.reset();
                        return Ok(EntryOutcome::Posted);
                    }
                    Generation::Unbalanced => return Ok(EntryOutcome::UnbalancedEntry),
                    Generation::Problem(message) => {
                        self.reset();
                        return Ok(EntryOutcome::Failed(message));
                    }
                    Generation::Rejected => {
                        self.reset();
                        return Ok(EntryOutcome::Failed("policy could not be saved".to_string()));
                    }
                    Generation::NotCreated if tries >= GENERATION_TRIES => break,
                    Generation::NotCreated => {
                        log::debug!("[posting] no result yet; generating again")
                    }
                }
            }
            desktop.pause(READINESS_POLL);
        }
        self.reset();
        Ok(EntryOutcome::Failed(format!("no policy after {tries} generation attempts")))
    }

    fn try_generate(&self, generate: &ControlHandle) -> Result<Generation> {
        let desktop = &self.desktop;
        desktop.ui.click(generate)?;
        desktop.pause(secs(0.5));

        if let Some(problem) = self.watch_for_problem() {
            return Ok(problem);
        }

        let list = self.window.child(Some("SysListView32"), None);
        let result = poll_until(desktop.clock, RESULT_WAIT, RESULT_POLL, || {
            let rows = desktop.ui.list_rows(&list).ok()?;
            rows.iter().flatten().find_map(|cell| {
                if cell.contains(POLICY_CREATED) {
                    Some(Generation::Created)
                } else if cell.contains(POLICY_REJECTED) {
                    Some(Generation::Rejected)
                } else {
                    None
                }
            })
        });
        if result.is_none() {
            log::error!("[posting] no result row after {RESULT_WAIT:?}");
        }
        Ok(result.unwrap_or(Generation::NotCreated))
    }

    /// Watches briefly for a `Problema` window after generating.
    fn watch_for_problem(&self) -> Option<Generation> {
        let desktop = &self.desktop;
        let problem = ControlHandle::titled(PROBLEM_TITLE);
        let dialogs = desktop.dialogs();
        poll_until(desktop.clock, PROBLEM_WATCH, PROBLEM_POLL, || {
            if !desktop.ui.exists(&problem).unwrap_or(false) {
                return None;
            }
            let event = dialogs.capture_window(&problem)?;
            let message = event.message.clone();
            log::warn!("[posting] problem window: {message}");
            match dialogs.handle(event) {
                DialogOutcome::Ignored(_) => None,
                DialogOutcome::Handled(Some(rule)) if rule == UNBALANCED_ENTRY => {
                    log::info!("[posting] debit/credit mismatch acknowledged");
                    desktop.pause(Duration::from_secs(1));
                    self.reset();
                    Some(Generation::Unbalanced)
                }
                outcome => {
                    let accept = problem.button(ACCEPT);
                    if desktop.ui.exists(&accept).unwrap_or(false) {
                        if let Err(err) = desktop.ui.click(&accept) {
                            log::debug!("[posting] cannot dismiss problem window: {err}");
                        }
                        desktop.pause(Duration::from_secs(1));
                    }
                    Some(Generation::Problem(match outcome {
                        DialogOutcome::Failed(reason) => format!("{reason}: {message}"),
                        _ => message,
                    }))
                }
            }
        })
    }

    /// Clears the posting window for the next entry.
    fn reset(&self) {
        let options = self.desktop.match_options().with_confidence(0.8);
        if !self.desktop.matcher().find_and_click_image(Affordance::New, &options) {
            log::warn!("[posting] could not click 'New'");
        }
    }
}
