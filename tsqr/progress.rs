use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::fmt;
use std::io::IsTerminal;
use std::sync::Mutex;

/// Which half of a stage a batch of tasks belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskPhase {
    Map,
    Reduce,
}

impl TaskPhase {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Map => "map tasks",
            Self::Reduce => "reduce tasks",
        }
    }
}

impl fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Position of a stage within its schedule, 1-based.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StageLabel {
    pub index: usize,
    pub total: usize,
}

impl fmt::Display for StageLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage {}/{}", self.index, self.total)
    }
}

/// Observer for task completion while a stage runs. Tasks finish on worker
/// threads, so callbacks take `&self`.
pub trait StageProgressObserver: Sync {
    fn on_phase_start(&self, stage: StageLabel, phase: TaskPhase, tasks: usize) {
        let _ = (stage, phase, tasks);
    }
    fn on_task_finish(&self, stage: StageLabel, phase: TaskPhase) {
        let _ = (stage, phase);
    }
    fn on_phase_finish(&self, stage: StageLabel, phase: TaskPhase) {
        let _ = (stage, phase);
    }
}

#[derive(Default)]
pub struct NoopStageProgress;

impl StageProgressObserver for NoopStageProgress {}

/// Draws one bar per phase on stderr. Hidden when stderr is not a terminal.
#[derive(Default)]
pub struct ConsoleStageProgress {
    bar: Mutex<Option<ProgressBar>>,
}

impl ConsoleStageProgress {
    pub fn new() -> Self {
        Self::default()
    }

    fn current(&self) -> Option<ProgressBar> {
        self.bar.lock().ok().and_then(|guard| guard.clone())
    }
}

fn create_progress_bar(len: u64, message: String) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    if let Ok(style) = ProgressStyle::with_template(
        "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb.set_message(message);
    pb
}

impl StageProgressObserver for ConsoleStageProgress {
    fn on_phase_start(&self, stage: StageLabel, phase: TaskPhase, tasks: usize) {
        let pb = create_progress_bar(tasks as u64, format!("{stage}: {phase}"));
        if let Ok(mut guard) = self.bar.lock() {
            if let Some(previous) = guard.replace(pb) {
                previous.finish_and_clear();
            }
        }
    }

    fn on_task_finish(&self, stage: StageLabel, phase: TaskPhase) {
        let _ = (stage, phase);
        if let Some(pb) = self.current() {
            pb.inc(1);
        }
    }

    fn on_phase_finish(&self, stage: StageLabel, phase: TaskPhase) {
        let _ = (stage, phase);
        if let Ok(mut guard) = self.bar.lock() {
            if let Some(pb) = guard.take() {
                pb.finish_and_clear();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        finished: AtomicUsize,
    }

    impl StageProgressObserver for Counting {
        fn on_task_finish(&self, stage: StageLabel, phase: TaskPhase) {
            let _ = (stage, phase);
            self.finished.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn default_methods_are_no_ops() {
        let label = StageLabel { index: 1, total: 2 };
        let counting = Counting::default();
        counting.on_phase_start(label, TaskPhase::Map, 3);
        counting.on_task_finish(label, TaskPhase::Map);
        counting.on_phase_finish(label, TaskPhase::Map);
        assert_eq!(counting.finished.load(Ordering::Relaxed), 1);
        assert_eq!(label.to_string(), "stage 1/2");
    }

    #[test]
    fn console_progress_survives_a_full_phase() {
        let label = StageLabel { index: 2, total: 2 };
        let console = ConsoleStageProgress::new();
        console.on_phase_start(label, TaskPhase::Reduce, 2);
        console.on_task_finish(label, TaskPhase::Reduce);
        console.on_task_finish(label, TaskPhase::Reduce);
        console.on_phase_finish(label, TaskPhase::Reduce);
        assert!(console.current().is_none());
    }
}
