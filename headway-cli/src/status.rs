// In-place status report: rewrites the window table on a fixed tick so the
// terminal shows one live view instead of a scrolling log.

use std::io::{Write, stderr};
use std::time::Duration;

use crossterm::QueueableCommand;
use crossterm::cursor::MoveUp;
use crossterm::terminal::{Clear, ClearType};
use headway_engine::WindowSnapshot;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const TICK: Duration = Duration::from_millis(500);

/// Render the window snapshot to stderr until cancelled. The last report is
/// left on screen.
pub async fn run_status_display(
    snapshots: watch::Receiver<WindowSnapshot>,
    token: CancellationToken,
) {
    let mut interval = tokio::time::interval(TICK);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut drawn_lines: u16 = 0;

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = interval.tick() => {
                let snapshot = snapshots.borrow().clone();
                if let Err(error) = redraw(&snapshot, &mut drawn_lines) {
                    debug!(error = %error, "status redraw failed, disabling display");
                    break;
                }
            }
        }
    }

    let _ = writeln!(stderr());
}

fn redraw(snapshot: &WindowSnapshot, drawn_lines: &mut u16) -> std::io::Result<()> {
    let mut report = snapshot.to_string();
    if !report.ends_with('\n') {
        report.push('\n');
    }
    let lines = report.matches('\n').count() as u16;

    let mut out = stderr();
    if *drawn_lines > 0 {
        out.queue(MoveUp(*drawn_lines))?;
        out.queue(Clear(ClearType::FromCursorDown))?;
    }
    out.write_all(report.as_bytes())?;
    out.flush()?;
    *drawn_lines = lines;
    Ok(())
}
