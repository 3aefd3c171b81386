//! Production backend for the capability traits: a PowerShell helper script
//! using UI Automation and user32, spawned once per call with a bounded wait
//! and retried through [`retry_action`]. Output is tab-separated rows.

use std::cell::RefCell;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use image::RgbImage;
use serde::Serialize;
use wait_timeout::ChildExt;

use crate::clock::{Clock, SystemClock};
use crate::error::{AutomationError, Result};
use crate::primitives::{retry_action, RetryPolicy};
use crate::surface::{
    ControlHandle, ControlInfo, ControlSelector, Point, Pointer, Rect, ScreenCapture, UiSurface,
    WindowInfo, WindowSelector,
};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct QueryDiagnostic {
    pub ok: bool,
    pub attempts: u32,
    pub error_code: Option<String>,
    pub message: Option<String>,
}

impl QueryDiagnostic {
    fn describe(&self) -> String {
        format!(
            "{}: {}",
            self.error_code.as_deref().unwrap_or("helper_failed"),
            self.message.as_deref().unwrap_or("no details")
        )
    }
}

/// Exit status the helper uses when the target does not resolve.
const TARGET_NOT_FOUND_EXIT: i32 = 3;

/// Why one helper invocation failed. `retryable` is false when another
/// attempt would see the same answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl HelperError {
    fn transient(code: &str, message: impl fmt::Display) -> Self {
        Self {
            code: code.to_string(),
            message: message.to_string(),
            retryable: true,
        }
    }
}

impl fmt::Display for HelperError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

fn reap(child: &mut Child) {
    if let Err(err) = child.kill() {
        log::debug!("[bridge] cannot kill helper: {err}");
    }
    if let Err(err) = child.wait() {
        log::debug!("[bridge] cannot reap helper: {err}");
    }
}

/// Spawns `program` once and waits at most `timeout`. Returns trimmed stdout;
/// empty output is a failure, so helpers print `ok` for actions.
pub fn run_helper(
    program: &str,
    args: &[String],
    timeout: Duration,
) -> std::result::Result<String, HelperError> {
    let mut child = Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| HelperError::transient("helper_spawn_failed", err))?;

    match child.wait_timeout(timeout) {
        Ok(Some(_)) => {}
        Ok(None) => {
            reap(&mut child);
            return Err(HelperError::transient(
                "helper_timeout",
                format!("{program} timed out after {timeout:?}"),
            ));
        }
        Err(err) => {
            reap(&mut child);
            return Err(HelperError::transient("helper_wait_failed", err));
        }
    }

    let output = child
        .wait_with_output()
        .map_err(|err| HelperError::transient("helper_output_failed", err))?;
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if output.status.success() {
        if stdout.is_empty() {
            return Err(HelperError::transient(
                "helper_empty_stdout",
                format!("{program} succeeded without output"),
            ));
        }
        return Ok(stdout);
    }

    let code = output.status.code().unwrap_or(1);
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    Err(HelperError {
        code: format!("helper_exit_{code}"),
        message: if stderr.is_empty() {
            format!("{program} exited with status {code}")
        } else {
            stderr
        },
        retryable: code != TARGET_NOT_FOUND_EXIT,
    })
}

/// Runs `invoke` under `policy`, stopping early on a non-retryable failure,
/// and reports what happened as a [`QueryDiagnostic`].
pub fn retry_helper(
    clock: &dyn Clock,
    policy: RetryPolicy,
    mut invoke: impl FnMut() -> std::result::Result<String, HelperError>,
) -> (Option<String>, QueryDiagnostic) {
    let mut attempts = 0;
    let mut last: Option<HelperError> = None;
    let outcome = retry_action(clock, policy, |attempt| {
        attempts = attempt;
        match invoke() {
            Ok(stdout) => Ok(Ok(stdout)),
            Err(err) if err.retryable => {
                last = Some(err.clone());
                Err(err)
            }
            Err(err) => {
                last = Some(err.clone());
                Ok(Err(err))
            }
        }
    });

    if let Ok(Ok(stdout)) = outcome {
        return (
            Some(stdout),
            QueryDiagnostic {
                ok: true,
                attempts,
                error_code: None,
                message: None,
            },
        );
    }
    (
        None,
        QueryDiagnostic {
            ok: false,
            attempts,
            error_code: last.as_ref().map(|err| err.code.clone()),
            message: last.map(|err| err.message),
        },
    )
}

/// [`run_helper`] with retries. Off Windows nothing is spawned.
pub fn query_helper(
    clock: &dyn Clock,
    policy: RetryPolicy,
    program: &str,
    args: &[String],
    timeout: Duration,
) -> (Option<String>, QueryDiagnostic) {
    if !cfg!(windows) {
        return (
            None,
            QueryDiagnostic {
                ok: false,
                attempts: 0,
                error_code: Some("unsupported_platform".to_string()),
                message: Some(format!("{program} helper requires Windows")),
            },
        );
    }
    retry_helper(clock, policy, || run_helper(program, args, timeout))
}

pub fn window_arg(selector: &WindowSelector) -> String {
    match selector {
        WindowSelector::Handle(hwnd) => format!("handle={hwnd}"),
        WindowSelector::Title(title) => format!("title={title}"),
        WindowSelector::TitlePrefix(prefix) => format!("prefix={prefix}"),
        WindowSelector::TitleContains(fragment) => format!("contains={fragment}"),
        WindowSelector::Foreground => "foreground=".to_string(),
    }
}

pub fn control_arg(control: Option<&ControlSelector>) -> String {
    match control {
        None => String::new(),
        Some(control) => format!(
            "{}|{}|{}",
            control.class_name.as_deref().unwrap_or(""),
            control.title.as_deref().unwrap_or(""),
            control.index
        ),
    }
}

fn parse_bool(raw: &str) -> Result<bool> {
    match raw.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(AutomationError::surface(format!(
            "unexpected helper answer '{other}'"
        ))),
    }
}

/// `left \t top \t right \t bottom` in screen pixels.
fn parse_rect(raw: &str) -> Result<Rect> {
    let parts: Vec<i32> = raw
        .trim()
        .split('\t')
        .map(|part| part.trim().parse::<i32>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|err| AutomationError::surface(format!("bad bounds '{raw}': {err}")))?;
    match parts[..] {
        [left, top, right, bottom] => Ok(Rect::new(left, top, right, bottom)),
        _ => Err(AutomationError::surface(format!("bad bounds '{raw}'"))),
    }
}

/// `hwnd \t pid \t class \t title` rows.
pub fn parse_window_rows(raw: &str) -> Vec<WindowInfo> {
    let mut windows = Vec::new();
    for line in raw.lines() {
        if line.trim().is_empty() || line.trim() == "none" {
            continue;
        }
        let parts: Vec<&str> = line.splitn(4, '\t').collect();
        if parts.len() < 3 {
            continue;
        }
        let hwnd = match parts[0].trim().parse::<u64>() {
            Ok(v) if v > 0 => v,
            _ => continue,
        };
        let pid = match parts[1].trim().parse::<u32>() {
            Ok(v) => v,
            _ => continue,
        };
        windows.push(WindowInfo {
            hwnd,
            pid,
            class_name: parts[2].trim().to_string(),
            title: parts.get(3).map(|v| v.trim().to_string()).unwrap_or_default(),
        });
    }
    windows
}

/// `class index \t class \t text` rows; the index is per class so the returned
/// handles resolve again through the helper.
pub fn parse_control_rows(raw: &str, window: &WindowSelector) -> Vec<ControlInfo> {
    let mut controls = Vec::new();
    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.splitn(3, '\t').collect();
        if parts.len() < 2 {
            continue;
        }
        let index = match parts[0].trim().parse::<usize>() {
            Ok(v) => v,
            _ => continue,
        };
        let class_name = parts[1].trim().to_string();
        controls.push(ControlInfo {
            handle: ControlHandle {
                window: window.clone(),
                control: Some(ControlSelector {
                    class_name: Some(class_name.clone()),
                    title: None,
                    index,
                }),
            },
            class_name,
            text: parts.get(2).map(|v| v.trim_end().to_string()).unwrap_or_default(),
        });
    }
    controls
}

pub fn parse_list_rows(raw: &str) -> Vec<Vec<String>> {
    raw.lines()
        .filter(|line| !line.trim().is_empty() && line.trim() != "none")
        .map(|line| line.split('\t').map(|cell| cell.trim().to_string()).collect())
        .collect()
}

pub struct PowerShellBridge {
    script: PathBuf,
    clock: Box<dyn Clock>,
    policy: RetryPolicy,
    timeout: Duration,
    last: RefCell<Option<QueryDiagnostic>>,
}

impl PowerShellBridge {
    /// Writes the helper script to the temp directory.
    pub fn install() -> Result<Self> {
        let name = format!("contabot-bridge-{}.ps1", std::process::id());
        let script = std::env::temp_dir().join(name);
        fs::write(&script, BRIDGE_SCRIPT)?;
        log::debug!("[bridge] helper script at {}", script.display());
        Ok(Self {
            script,
            clock: Box::new(SystemClock),
            policy: RetryPolicy::new(2, Duration::from_millis(150), 1.0),
            timeout: Duration::from_secs(15),
            last: RefCell::new(None),
        })
    }

    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn script_path(&self) -> &Path {
        &self.script
    }

    pub fn last_diagnostic(&self) -> Option<QueryDiagnostic> {
        self.last.borrow().clone()
    }

    fn call(&self, op: &str, target: Option<&ControlHandle>, arg: &str) -> Result<String> {
        let (window, control) = match target {
            Some(target) => (window_arg(&target.window), control_arg(target.control.as_ref())),
            None => (String::new(), String::new()),
        };
        let args = vec![
            "-NoProfile".to_string(),
            "-NonInteractive".to_string(),
            "-ExecutionPolicy".to_string(),
            "Bypass".to_string(),
            "-File".to_string(),
            self.script.display().to_string(),
            "-Op".to_string(),
            op.to_string(),
            "-Window".to_string(),
            window,
            "-Control".to_string(),
            control,
            "-Arg".to_string(),
            arg.to_string(),
        ];
        let (stdout, diagnostic) =
            query_helper(self.clock.as_ref(), self.policy, "powershell", &args, self.timeout);
        *self.last.borrow_mut() = Some(diagnostic.clone());
        match stdout {
            Some(stdout) => Ok(stdout),
            None => {
                let what = target.map(ToString::to_string).unwrap_or_default();
                log::debug!("[bridge] {op} {what} failed: {}", diagnostic.describe());
                Err(AutomationError::surface(format!(
                    "{op} {what}: {}",
                    diagnostic.describe()
                )))
            }
        }
    }

    fn action(&self, op: &str, target: &ControlHandle, arg: &str) -> Result<()> {
        self.call(op, Some(target), arg).map(|_| ())
    }
}

impl Drop for PowerShellBridge {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.script);
    }
}

impl UiSurface for PowerShellBridge {
    fn exists(&self, target: &ControlHandle) -> Result<bool> {
        parse_bool(&self.call("exists", Some(target), "")?)
    }

    fn is_visible(&self, target: &ControlHandle) -> Result<bool> {
        parse_bool(&self.call("visible", Some(target), "")?)
    }

    fn is_enabled(&self, target: &ControlHandle) -> Result<bool> {
        parse_bool(&self.call("enabled", Some(target), "")?)
    }

    fn click(&self, target: &ControlHandle) -> Result<()> {
        self.action("click", target, "")
    }

    fn double_click(&self, target: &ControlHandle) -> Result<()> {
        self.action("dclick", target, "")
    }

    fn type_text(&self, target: &ControlHandle, keys: &str) -> Result<()> {
        self.action("type", target, keys)
    }

    fn window_text(&self, target: &ControlHandle) -> Result<String> {
        // The helper prefixes text with '=' so an empty caption is still output.
        let raw = self.call("text", Some(target), "")?;
        Ok(raw.strip_prefix('=').unwrap_or(&raw).to_string())
    }

    fn children(
        &self,
        target: &ControlHandle,
        class_name: Option<&str>,
    ) -> Result<Vec<ControlInfo>> {
        let raw = self.call("children", Some(target), class_name.unwrap_or(""))?;
        Ok(parse_control_rows(&raw, &target.window))
    }

    fn top_level_windows(&self, title: Option<&str>) -> Result<Vec<WindowInfo>> {
        let filter = match title {
            None => "*".to_string(),
            Some(title) => format!("title={title}"),
        };
        let raw = self.call("windows", None, &filter)?;
        Ok(parse_window_rows(&raw))
    }

    fn foreground_window(&self) -> Result<Option<WindowInfo>> {
        let raw = self.call("foreground", None, "")?;
        Ok(parse_window_rows(&raw).into_iter().next())
    }

    fn focus(&self, target: &ControlHandle) -> Result<()> {
        self.action("focus", target, "")
    }

    fn maximize(&self, target: &ControlHandle) -> Result<()> {
        self.action("maximize", target, "")
    }

    fn close(&self, target: &ControlHandle) -> Result<()> {
        self.action("close", target, "")
    }

    fn bounds(&self, target: &ControlHandle) -> Result<Rect> {
        parse_rect(&self.call("bounds", Some(target), "")?)
    }

    fn list_rows(&self, target: &ControlHandle) -> Result<Vec<Vec<String>>> {
        let raw = self.call("rows", Some(target), "")?;
        Ok(parse_list_rows(&raw))
    }

    fn activate_row(&self, target: &ControlHandle, row: usize) -> Result<()> {
        self.action("activate", target, &row.to_string())
    }

    fn select_menu(&self, target: &ControlHandle, path: &str) -> Result<()> {
        self.action("menu", target, path)
    }
}

impl ScreenCapture for PowerShellBridge {
    fn capture(&self) -> Result<RgbImage> {
        let path = std::env::temp_dir().join(format!("contabot-screen-{}.png", std::process::id()));
        self.call("capture", None, &path.display().to_string())?;
        let decoded = image::open(&path);
        let _ = fs::remove_file(&path);
        Ok(decoded?.to_rgb8())
    }
}

impl Pointer for PowerShellBridge {
    fn click_at(&self, point: Point, double: bool) -> Result<()> {
        let arg = format!("{},{},{}", point.x, point.y, if double { 2 } else { 1 });
        self.call("pointer", None, &arg).map(|_| ())
    }
}

const BRIDGE_SCRIPT: &str = r#"param(
  [string]$Op,
  [string]$Window = "",
  [string]$Control = "",
  [string]$Arg = ""
)
$ErrorActionPreference = "Stop"
[Console]::OutputEncoding = [System.Text.Encoding]::UTF8
Add-Type -AssemblyName UIAutomationClient, UIAutomationTypes, System.Windows.Forms, System.Drawing
Add-Type @"
using System;
using System.Runtime.InteropServices;
public static class Native {
  [DllImport("user32.dll")] public static extern IntPtr GetForegroundWindow();
  [DllImport("user32.dll")] public static extern bool SetForegroundWindow(IntPtr h);
  [DllImport("user32.dll")] public static extern bool ShowWindow(IntPtr h, int cmd);
  [DllImport("user32.dll")] public static extern bool SetCursorPos(int x, int y);
  [DllImport("user32.dll")] public static extern void mouse_event(uint flags, uint x, uint y, uint data, UIntPtr extra);
}
"@
$AE = [System.Windows.Automation.AutomationElement]
$Scope = [System.Windows.Automation.TreeScope]
$AnyCond = [System.Windows.Automation.Condition]::TrueCondition

function Fail($message) { [Console]::Error.WriteLine($message); exit 3 }

function Top-Windows { $AE::RootElement.FindAll($Scope::Children, $AnyCond) }

function Resolve-Window([string]$sel) {
  $kind, $value = $sel -split '=', 2
  if ($kind -eq 'foreground') {
    $h = [Native]::GetForegroundWindow()
    if ($h -eq [IntPtr]::Zero) { return $null }
    return $AE::FromHandle($h)
  }
  foreach ($w in Top-Windows) {
    $t = $w.Current.Name
    switch ($kind) {
      'handle' { if ([int64]$w.Current.NativeWindowHandle -eq [int64]$value) { return $w } }
      'title' { if ($t -eq $value) { return $w } }
      'prefix' { if ($t.StartsWith($value)) { return $w } }
      'contains' { if ($t.Contains($value)) { return $w } }
    }
  }
  return $null
}

function Resolve-Target {
  $w = Resolve-Window $Window
  if ($null -eq $w -or $Control -eq '') { return $w }
  $class, $title, $index = $Control -split '\|', 3
  $found = @()
  foreach ($c in $w.FindAll($Scope::Descendants, $AnyCond)) {
    if ($class -ne '' -and $c.Current.ClassName -ne $class) { continue }
    if ($title -ne '' -and $c.Current.Name -ne $title) { continue }
    $found += $c
  }
  if ([int]$index -lt $found.Count) { return $found[[int]$index] }
  return $null
}

function Require-Target {
  $t = Resolve-Target
  if ($null -eq $t) { Fail "target not found: $Window $Control" }
  return $t
}

function Window-Row($w) {
  "{0}`t{1}`t{2}`t{3}" -f $w.Current.NativeWindowHandle, $w.Current.ProcessId, $w.Current.ClassName, $w.Current.Name
}

function Click-At([int]$x, [int]$y, [int]$count) {
  [Native]::SetCursorPos($x, $y) | Out-Null
  for ($i = 0; $i -lt $count; $i++) {
    [Native]::mouse_event(0x0002, 0, 0, 0, [UIntPtr]::Zero)
    [Native]::mouse_event(0x0004, 0, 0, 0, [UIntPtr]::Zero)
    Start-Sleep -Milliseconds 40
  }
}

function Click-Element($e, [int]$count) {
  $r = $e.Current.BoundingRectangle
  if ($r.IsEmpty) { Fail "target has no bounds" }
  Click-At ([int]($r.X + $r.Width / 2)) ([int]($r.Y + $r.Height / 2)) $count
}

function Focus-Element($e) {
  $h = $e.Current.NativeWindowHandle
  if ($h -ne 0) { [Native]::SetForegroundWindow([IntPtr]$h) | Out-Null }
  try { $e.SetFocus() } catch { }
}

switch ($Op) {
  'exists' { if ($null -eq (Resolve-Target)) { 'false' } else { 'true' } }
  'visible' { $t = Resolve-Target; if ($null -ne $t -and -not $t.Current.IsOffscreen) { 'true' } else { 'false' } }
  'enabled' { $t = Resolve-Target; if ($null -ne $t -and $t.Current.IsEnabled) { 'true' } else { 'false' } }
  'click' { Click-Element (Require-Target) 1; 'ok' }
  'dclick' { Click-Element (Require-Target) 2; 'ok' }
  'type' {
    $t = Require-Target
    Focus-Element $t
    [System.Windows.Forms.SendKeys]::SendWait($Arg)
    'ok'
  }
  'text' {
    $t = Require-Target
    $text = $t.Current.Name
    $pattern = $null
    if ($Control -ne '' -and $t.TryGetCurrentPattern([System.Windows.Automation.ValuePattern]::Pattern, [ref]$pattern)) {
      $text = $pattern.Current.Value
    }
    "=$text"
  }
  'children' {
    $t = Require-Target
    $counts = @{}
    $rows = foreach ($c in $t.FindAll($Scope::Descendants, $AnyCond)) {
      $cls = $c.Current.ClassName
      if (-not $counts.ContainsKey($cls)) { $counts[$cls] = 0 }
      $idx = $counts[$cls]
      $counts[$cls] = $idx + 1
      if ($Arg -ne '' -and $cls -ne $Arg) { continue }
      "{0}`t{1}`t{2}" -f $idx, $cls, ($c.Current.Name -replace "[`t`r`n]", ' ')
    }
    if ($rows) { $rows } else { 'none' }
  }
  'windows' {
    $rows = foreach ($w in Top-Windows) {
      if ($Arg -ne '*') {
        $wanted = $Arg.Substring(6)
        if ($w.Current.Name -ne $wanted) { continue }
      }
      Window-Row $w
    }
    if ($rows) { $rows } else { 'none' }
  }
  'foreground' {
    $h = [Native]::GetForegroundWindow()
    if ($h -eq [IntPtr]::Zero) { 'none' } else { Window-Row ($AE::FromHandle($h)) }
  }
  'focus' { Focus-Element (Require-Target); 'ok' }
  'bounds' {
    $r = (Require-Target).Current.BoundingRectangle
    if ($r.IsEmpty) { Fail "target has no bounds" }
    "{0}`t{1}`t{2}`t{3}" -f [int]$r.Left, [int]$r.Top, [int]$r.Right, [int]$r.Bottom
  }
  'maximize' { $t = Require-Target; [Native]::ShowWindow([IntPtr]$t.Current.NativeWindowHandle, 3) | Out-Null; 'ok' }
  'close' {
    $t = Require-Target
    $pattern = $null
    if ($t.TryGetCurrentPattern([System.Windows.Automation.WindowPattern]::Pattern, [ref]$pattern)) { $pattern.Close() }
    'ok'
  }
  'rows' {
    $t = Require-Target
    $items = $t.FindAll($Scope::Children, (New-Object System.Windows.Automation.PropertyCondition($AE::ControlTypeProperty, [System.Windows.Automation.ControlType]::ListItem)))
    $rows = foreach ($item in $items) {
      $cells = @($item.Current.Name)
      foreach ($cell in $item.FindAll($Scope::Children, $AnyCond)) { if ($cell.Current.Name -ne $item.Current.Name) { $cells += $cell.Current.Name } }
      ($cells | ForEach-Object { $_ -replace "[`t`r`n]", ' ' }) -join "`t"
    }
    if ($rows) { $rows } else { 'none' }
  }
  'activate' {
    $t = Require-Target
    $items = $t.FindAll($Scope::Children, (New-Object System.Windows.Automation.PropertyCondition($AE::ControlTypeProperty, [System.Windows.Automation.ControlType]::ListItem)))
    $row = [int]$Arg
    if ($row -ge $items.Count) { Fail "row $row out of range" }
    Click-Element $items[$row] 2
    'ok'
  }
  'menu' {
    $t = Require-Target
    Focus-Element $t
    $scopeElement = $t
    foreach ($name in ($Arg -split '->')) {
      $cond = New-Object System.Windows.Automation.PropertyCondition($AE::NameProperty, $name.Trim())
      $item = $null
      for ($i = 0; $i -lt 20 -and $null -eq $item; $i++) {
        $item = $scopeElement.FindFirst($Scope::Descendants, $cond)
        if ($null -eq $item) { $item = $AE::RootElement.FindFirst($Scope::Descendants, $cond) }
        if ($null -eq $item) { Start-Sleep -Milliseconds 100 }
      }
      if ($null -eq $item) { Fail "menu item not found: $name" }
      $pattern = $null
      if ($item.TryGetCurrentPattern([System.Windows.Automation.ExpandCollapsePattern]::Pattern, [ref]$pattern)) {
        $pattern.Expand()
      } elseif ($item.TryGetCurrentPattern([System.Windows.Automation.InvokePattern]::Pattern, [ref]$pattern)) {
        $pattern.Invoke()
      } else {
        Click-Element $item 1
      }
      $scopeElement = $item
    }
    'ok'
  }
  'capture' {
    $bounds = [System.Windows.Forms.SystemInformation]::VirtualScreen
    $bmp = New-Object System.Drawing.Bitmap $bounds.Width, $bounds.Height
    $g = [System.Drawing.Graphics]::FromImage($bmp)
    $g.CopyFromScreen($bounds.Left, $bounds.Top, 0, 0, $bmp.Size)
    $bmp.Save($Arg, [System.Drawing.Imaging.ImageFormat]::Png)
    $g.Dispose(); $bmp.Dispose()
    $Arg
  }
  'pointer' {
    $x, $y, $count = $Arg -split ','
    Click-At ([int]$x) ([int]$y) ([int]$count)
    'ok'
  }
  default { [Console]::Error.WriteLine("unknown op: $Op"); exit 2 }
}
"#;
