//! Browser automation through a generated Playwright script.
//!
//! Actions are serialized to one JSON literal and interpreted by a fixed
//! script body, so selectors, values and scripts are never spliced into
//! generated code.

use std::time::Duration;

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SandboxError;

use super::ops::shell_quote;
use super::provider::CommandRequest;
use super::session::SandboxSession;

/// Default ceiling for one browser script.
pub const DEFAULT_BROWSER_TIMEOUT: Duration = Duration::from_secs(60);

const RESULT_MARKER: &str = "__RESULT__";
const SCRATCH_DIR: &str = ".issue-fixer";

/// A declarative browser step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrowserAction {
    Navigate {
        url: String,
    },
    Click {
        selector: String,
    },
    Fill {
        selector: String,
        value: String,
    },
    WaitForSelector {
        selector: String,
    },
    Wait {
        ms: u64,
    },
    Screenshot {
        #[serde(default)]
        full_page: bool,
    },
    /// Evaluates a JavaScript expression in the page.
    Evaluate {
        script: String,
    },
    GetText {
        selector: String,
    },
    /// Inner HTML of `selector`, or the whole document.
    GetHtml {
        #[serde(default)]
        selector: Option<String>,
    },
    Type {
        selector: String,
        text: String,
    },
    /// Presses a key on `selector`, or on the focused element.
    Press {
        #[serde(default)]
        selector: Option<String>,
        key: String,
    },
    Select {
        selector: String,
        value: String,
    },
    Hover {
        selector: String,
    },
    Scroll {
        #[serde(default)]
        x: i64,
        #[serde(default)]
        y: i64,
    },
}

/// Parsed result of a browser script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BrowserOutcome {
    pub success: bool,
    /// Values produced by evaluate/get_text/get_html steps, in order.
    #[serde(default)]
    pub results: Vec<Value>,
    /// Console lines captured from the page.
    #[serde(default)]
    pub console: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
    /// Base64 PNG when a screenshot was taken.
    #[serde(skip_deserializing)]
    pub screenshot: Option<String>,
}

/// Shape printed by the script after the result marker.
#[derive(Deserialize)]
struct ScriptResult {
    success: bool,
    #[serde(default)]
    results: Vec<Value>,
    #[serde(default)]
    console: Vec<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    screenshot: Option<String>,
}

const SCRIPT_BODY: &str = r#"
(async () => {
  const consoleLines = [];
  const results = [];
  let screenshot = null;
  let browser;
  const report = (extra) => {
    console.log('__RESULT__' + JSON.stringify(Object.assign({ results, console: consoleLines, screenshot }, extra)));
  };
  try {
    const { chromium } = require('playwright');
    browser = await chromium.launch({ headless: true });
    const page = await browser.newPage();
    page.setDefaultTimeout(options.stepTimeoutMs);
    page.on('console', (msg) => consoleLines.push('[' + msg.type() + '] ' + msg.text()));
    page.on('pageerror', (err) => consoleLines.push('[pageerror] ' + String(err)));
    for (const action of actions) {
      switch (action.type) {
        case 'navigate': await page.goto(action.url, { waitUntil: 'load' }); break;
        case 'click': await page.click(action.selector); break;
        case 'fill': await page.fill(action.selector, action.value); break;
        case 'wait_for_selector': await page.waitForSelector(action.selector); break;
        case 'wait': await page.waitForTimeout(action.ms); break;
        case 'screenshot':
          await page.screenshot({ path: options.screenshotPath, fullPage: !!action.full_page });
          screenshot = options.screenshotPath;
          break;
        case 'evaluate': results.push(await page.evaluate(action.script)); break;
        case 'get_text': results.push(await page.textContent(action.selector)); break;
        case 'get_html':
          results.push(action.selector ? await page.innerHTML(action.selector) : await page.content());
          break;
        case 'type': await page.type(action.selector, action.text); break;
        case 'press':
          if (action.selector) { await page.press(action.selector, action.key); }
          else { await page.keyboard.press(action.key); }
          break;
        case 'select': await page.selectOption(action.selector, action.value); break;
        case 'hover': await page.hover(action.selector); break;
        case 'scroll': await page.mouse.wheel(action.x || 0, action.y || 0); break;
        default: throw new Error('unknown action: ' + action.type);
      }
    }
    report({ success: true });
  } catch (err) {
    report({ success: false, error: String((err && err.message) || err) });
  } finally {
    if (browser) { await browser.close(); }
  }
})();
"#;

/// Generates the Node script for `actions`.
///
/// User data appears only inside the two JSON literals at the top.
pub fn generate_script(
    actions: &[BrowserAction],
    screenshot_path: &str,
    step_timeout: Duration,
) -> Result<String, SandboxError> {
    let actions_json = serde_json::to_string(actions)
        .map_err(|e| SandboxError::Operation(format!("cannot encode browser actions: {}", e)))?;
    let options_json = serde_json::to_string(&serde_json::json!({
        "screenshotPath": screenshot_path,
        "stepTimeoutMs": step_timeout.as_millis() as u64,
    }))
    .map_err(|e| SandboxError::Operation(format!("cannot encode browser options: {}", e)))?;

    Ok(format!(
        "'use strict';\nconst actions = {};\nconst options = {};\n{}",
        actions_json, options_json, SCRIPT_BODY
    ))
}

/// Parses the last result line of the script output.
///
/// Returns `None` when no line parses; the caller reports that as an
/// unsuccessful outcome.
fn parse_result(stdout: &str) -> Option<ScriptResult> {
    stdout
        .lines()
        .rev()
        .filter_map(|line| line.trim().strip_prefix(RESULT_MARKER))
        .find_map(|json| serde_json::from_str(json).ok())
}

/// Runs `actions` in one headless browser session inside the sandbox.
pub async fn run_browser(
    session: &SandboxSession,
    actions: &[BrowserAction],
    timeout: Option<Duration>,
) -> Result<BrowserOutcome, SandboxError> {
    let handle = session.handle()?;
    if actions.is_empty() {
        return Err(SandboxError::Operation("no browser actions given".to_string()));
    }

    let timeout = timeout.unwrap_or(DEFAULT_BROWSER_TIMEOUT);
    let run_id = uuid::Uuid::new_v4().simple().to_string();
    let scratch = format!("{}/{}", handle.home_dir().trim_end_matches('/'), SCRATCH_DIR);
    let script_path = format!("{}/browser-{}.js", scratch, run_id);
    let screenshot_path = format!("{}/shot-{}.png", scratch, run_id);

    let script = generate_script(actions, &screenshot_path, timeout)?;
    handle.write_file(&script_path, script.as_bytes()).await?;

    let command = format!(
        "NODE_PATH=\"$(npm root -g 2>/dev/null)\" node {}",
        shell_quote(&script_path)
    );
    tracing::info!(actions = actions.len(), timeout_secs = timeout.as_secs(), "running browser script");

    // The script applies `timeout` per step; the outer ceiling covers launch.
    let run_result = handle
        .run(
            CommandRequest::new(command, timeout + Duration::from_secs(30))
                .in_dir(session.working_dir()?),
        )
        .await;

    let cleanup = format!("rm -f {} {}", shell_quote(&script_path), shell_quote(&screenshot_path));

    let out = match run_result {
        Ok(out) => out,
        Err(e) => {
            if let Err(cleanup_err) = handle
                .run(CommandRequest::new(cleanup, Duration::from_secs(10)))
                .await
            {
                tracing::warn!(error = %cleanup_err, "browser scratch cleanup failed");
            }
            return Err(e);
        }
    };

    let outcome = match parse_result(&out.stdout) {
        Some(parsed) => {
            let screenshot = match parsed.screenshot.as_deref() {
                Some(path) => match handle.read_bytes(path).await {
                    Ok(bytes) => Some(base64::engine::general_purpose::STANDARD.encode(bytes)),
                    Err(e) => {
                        tracing::warn!(error = %e, "screenshot could not be read");
                        None
                    }
                },
                None => None,
            };
            BrowserOutcome {
                success: parsed.success,
                results: parsed.results,
                console: parsed.console,
                error: parsed.error,
                screenshot,
            }
        }
        None => {
            tracing::warn!(exit_code = out.exit_code, "browser script produced no result line");
            BrowserOutcome {
                success: false,
                error: Some(format!(
                    "could not parse browser result (exit {}): {}",
                    out.exit_code,
                    tail(&out.stderr, 500)
                )),
                console: out.stdout.lines().map(str::to_string).collect(),
                ..Default::default()
            }
        }
    };

    if let Err(e) = handle
        .run(CommandRequest::new(cleanup, Duration::from_secs(10)))
        .await
    {
        tracing::warn!(error = %e, "browser scratch cleanup failed");
    }

    Ok(outcome)
}

fn tail(text: &str, max: usize) -> &str {
    let text = text.trim();
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::testing::{cloned_session, exit, ok, Reply, ScriptedSandbox};

    #[test]
    fn hostile_selectors_stay_inside_json_literal() {
        let hostile = "'); require('child_process').execSync('touch /pwned'); ('`${x}`</script>\"";
        let actions = vec![
            BrowserAction::Click {
                selector: hostile.to_string(),
            },
            BrowserAction::Evaluate {
                script: "document.title\n//\"".to_string(),
            },
        ];
        let script = generate_script(&actions, "/tmp/shot.png", Duration::from_secs(5)).unwrap();

        let actions_line = script
            .lines()
            .find(|l| l.starts_with("const actions = "))
            .unwrap();
        let literal = actions_line
            .strip_prefix("const actions = ")
            .unwrap()
            .strip_suffix(';')
            .unwrap();
        let decoded: Vec<BrowserAction> = serde_json::from_str(literal).unwrap();
        assert_eq!(decoded, actions);

        // Everything after the two data lines is the fixed interpreter.
        assert!(script.ends_with(SCRIPT_BODY));
        assert_eq!(script.matches("child_process").count(), 1);
        assert!(!actions_line.contains('\n'));
    }

    #[test]
    fn actions_deserialize_from_tagged_json() {
        let actions: Vec<BrowserAction> = serde_json::from_value(serde_json::json!([
            {"type": "navigate", "url": "http://localhost:3000"},
            {"type": "wait_for_selector", "selector": "#app"},
            {"type": "press", "key": "Enter"},
            {"type": "screenshot"},
            {"type": "scroll", "y": 400}
        ]))
        .unwrap();
        assert_eq!(actions[2], BrowserAction::Press { selector: None, key: "Enter".to_string() });
        assert_eq!(actions[3], BrowserAction::Screenshot { full_page: false });
        assert_eq!(actions[4], BrowserAction::Scroll { x: 0, y: 400 });
    }

    #[test]
    fn parse_result_takes_last_valid_marker_line() {
        let stdout = "npm warn\n__RESULT__{\"success\":false}\nnoise\n__RESULT__{\"success\":true,\"results\":[\"Title\"]}\n__RESULT__{broken\n";
        let parsed = parse_result(stdout).unwrap();
        assert!(parsed.success);
        assert_eq!(parsed.results, vec![Value::String("Title".to_string())]);
        assert!(parse_result("no marker here").is_none());
    }

    #[tokio::test]
    async fn run_browser_attaches_screenshot() {
        let sandbox = ScriptedSandbox::new()
            .on(
                "node",
                ok("__RESULT__{\"success\":true,\"results\":[],\"console\":[\"[log] ready\"],\"screenshot\":\"/tmp/shot.png\"}\n"),
            )
            .with_file("/tmp/shot.png", "PNG");
        let (session, sandbox) = cloned_session(sandbox).await;

        let outcome = run_browser(
            &session,
            &[BrowserAction::Navigate { url: "http://localhost:3000".to_string() }, BrowserAction::Screenshot { full_page: true }],
            None,
        )
        .await
        .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.console, vec!["[log] ready".to_string()]);
        assert_eq!(outcome.screenshot.as_deref(), Some("UE5H"));
        let commands = sandbox.commands();
        assert!(commands[0].starts_with("NODE_PATH=\"$(npm root -g 2>/dev/null)\" node '/home/user/.issue-fixer/browser-"));
        assert!(commands.last().unwrap().starts_with("rm -f"));
    }

    #[tokio::test]
    async fn unparseable_result_is_unsuccessful_not_error() {
        let sandbox = ScriptedSandbox::new().on("node", exit(1, "", "Cannot find module 'playwright'"));
        let (session, _sandbox) = cloned_session(sandbox).await;

        let outcome = run_browser(&session, &[BrowserAction::Wait { ms: 10 }], None)
            .await
            .unwrap();
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("Cannot find module"));
    }

    #[tokio::test]
    async fn timed_out_script_is_still_cleaned_up() {
        let sandbox = ScriptedSandbox::new()
            .on(
                "node",
                Reply::Error(SandboxError::Timeout {
                    operation: "command".to_string(),
                    seconds: 90,
                }),
            )
            .on("rm -f", Reply::Error(SandboxError::Operation("rm failed".to_string())));
        let (session, sandbox) = cloned_session(sandbox).await;

        let err = run_browser(&session, &[BrowserAction::Wait { ms: 10 }], None)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Timeout { seconds: 90, .. }));
        assert!(sandbox.commands().last().unwrap().starts_with("rm -f"));
    }
}
