//! Window registry: create, rename, close and resume sessions.

use super::{Orchestrator, EXIT_MARGIN};
use crate::error::{Error, Result};
use crate::options::RunOptions;
use crate::types::{InputHistory, Window, WindowSource};
use chrono::Utc;

/// Parameters for [`Orchestrator::create_window`].
#[derive(Debug, Clone, Default)]
pub struct NewWindow {
    /// Explicit id; generated when absent
    pub id: Option<String>,
    pub name: Option<String>,
    pub thread_id: Option<String>,
    pub defaults: RunOptions,
    pub source: WindowSource,
}

impl NewWindow {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn with_defaults(mut self, defaults: RunOptions) -> Self {
        self.defaults = defaults;
        self
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

impl Orchestrator {
    /// Create an idle window.
    pub fn create_window(&self, new: NewWindow) -> Result<Window> {
        let window = {
            let mut world = self.inner.world();
            let id = match non_empty(new.id.as_deref()) {
                Some(id) if world.windows.contains_key(&id) => {
                    return Err(Error::InvalidArgument(format!(
                        "window {id} already exists"
                    )))
                }
                Some(id) => id,
                None => uuid::Uuid::new_v4().to_string(),
            };
            let name = non_empty(new.name.as_deref())
                .unwrap_or_else(|| format!("Window {}", world.windows.len() + 1));

            let mut window = Window::new(id, name, new.source);
            window.thread_id = non_empty(new.thread_id.as_deref()).unwrap_or_default();
            window.default_run_options = RunOptions::default().merge(&new.defaults);
            world.windows.insert(window.id.clone(), window.clone());
            window
        };

        tracing::info!(
            window_id = %window.id,
            name = %window.name,
            source = ?window.source,
            "Window created"
        );
        self.inner.schedule_save();
        Ok(window)
    }

    /// Create an idle window bound to an existing external thread.
    pub fn resume_window(&self, thread_id: &str, name: Option<&str>) -> Result<Window> {
        let thread_id = thread_id.trim();
        if thread_id.is_empty() {
            return Err(Error::InvalidArgument("thread id is empty".to_string()));
        }
        let short: String = thread_id.chars().take(8).collect();
        self.create_window(NewWindow {
            name: Some(non_empty(name).unwrap_or_else(|| format!("Resumed {short}"))),
            thread_id: Some(thread_id.to_string()),
            ..Default::default()
        })
    }

    pub fn rename_window(&self, id: &str, name: &str) -> Result<Window> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::InvalidArgument("window name is empty".to_string()));
        }
        let window = {
            let mut world = self.inner.world();
            let window = world
                .windows
                .get_mut(id)
                .ok_or_else(|| Error::window_not_found(id))?;
            window.name = name.to_string();
            window.updated_at = Utc::now();
            window.clone()
        };
        self.inner.schedule_save();
        Ok(window)
    }

    /// Merge `options` into the window's defaults.
    pub fn set_default_options(&self, id: &str, options: &RunOptions) -> Result<Window> {
        let window = {
            let mut world = self.inner.world();
            let window = world
                .windows
                .get_mut(id)
                .ok_or_else(|| Error::window_not_found(id))?;
            window.default_run_options = window.default_run_options.merge(options);
            window.updated_at = Utc::now();
            window.clone()
        };
        self.inner.schedule_save();
        Ok(window)
    }

    /// Delete a window with its runs, event logs and input history.
    ///
    /// An active run is aborted first and its exit awaited, bounded by the
    /// abort grace period.
    pub async fn close_window(&self, id: &str) -> Result<()> {
        let active = {
            let world = self.inner.world();
            let window = world.windows.get(id).ok_or_else(|| Error::window_not_found(id))?;
            if window.status.is_active() && !window.active_run_id.is_empty() {
                Some(window.active_run_id.clone())
            } else {
                None
            }
        };

        if let Some(run_id) = active {
            self.abort_run(&run_id)?;
            let wait = self.inner.config.runs.abort_grace() + EXIT_MARGIN;
            let run = self.wait_for_run(&run_id, wait).await?;
            if !run.status.is_terminal() {
                tracing::warn!(run_id = %run_id, "Run did not exit before its window was closed");
            }
        }

        {
            let mut world = self.inner.world();
            if world.windows.remove(id).is_none() {
                return Err(Error::window_not_found(id));
            }
            let run_ids: Vec<String> = world
                .runs
                .values()
                .filter(|s| s.run.window_id == id)
                .map(|s| s.run.id.clone())
                .collect();
            for run_id in &run_ids {
                world.runs.remove(run_id);
                if let Some(active) = world.active.remove(run_id) {
                    active.cancel.cancel();
                }
            }
            world.transcripts.remove(id);
            world.inputs.remove(id);
        }

        tracing::info!(window_id = %id, "Window closed");
        self.inner.schedule_save();
        Ok(())
    }

    pub fn get_window(&self, id: &str) -> Result<Window> {
        self.inner
            .world()
            .windows
            .get(id)
            .cloned()
            .ok_or_else(|| Error::window_not_found(id))
    }

    /// All windows, oldest first. Pending queue requests are applied first.
    pub fn list_windows(&self) -> Vec<Window> {
        if let Err(e) = self.reconcile_requests() {
            tracing::warn!(error = %e, "Request queue reconciliation failed");
        }
        let mut windows: Vec<Window> = self.inner.world().windows.values().cloned().collect();
        windows.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        windows
    }

    pub fn input_history(&self, id: &str) -> Result<InputHistory> {
        let world = self.inner.world();
        if !world.windows.contains_key(id) {
            return Err(Error::window_not_found(id));
        }
        Ok(world.inputs.get(id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::paths::SharedDir;
    use crate::types::WindowStatus;
    use tempfile::TempDir;

    fn orchestrator(dir: &TempDir) -> Orchestrator {
        Orchestrator::open(SharedDir::new(dir.path()), Config::default()).unwrap()
    }

    #[tokio::test]
    async fn test_window_crud() {
        let dir = TempDir::new().unwrap();
        let deck = orchestrator(&dir);

        let window = deck.create_window(NewWindow::named("first")).unwrap();
        assert_eq!(window.status, WindowStatus::Idle);
        assert!(window.thread_id.is_empty());

        let renamed = deck.rename_window(&window.id, "  second ").unwrap();
        assert_eq!(renamed.name, "second");
        assert!(matches!(
            deck.rename_window(&window.id, " "),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            deck.rename_window("missing", "x"),
            Err(Error::NotFound { .. })
        ));

        deck.close_window(&window.id).await.unwrap();
        assert!(deck.get_window(&window.id).is_err());
        assert!(deck.close_window(&window.id).await.is_err());
    }

    #[tokio::test]
    async fn test_resume_window_carries_thread() {
        let dir = TempDir::new().unwrap();
        let deck = orchestrator(&dir);

        let window = deck.resume_window("thread-abcdef-123", None).unwrap();
        assert_eq!(window.thread_id, "thread-abcdef-123");
        assert_eq!(window.name, "Resumed thread-a");
        assert!(deck.resume_window("  ", None).is_err());
    }

    #[tokio::test]
    async fn test_duplicate_explicit_id_is_rejected() {
        let dir = TempDir::new().unwrap();
        let deck = orchestrator(&dir);
        let request = NewWindow {
            id: Some("w1".into()),
            ..Default::default()
        };
        deck.create_window(request.clone()).unwrap();
        assert!(matches!(
            deck.create_window(request),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_default_options_merge() {
        let dir = TempDir::new().unwrap();
        let deck = orchestrator(&dir);
        let window = deck
            .create_window(NewWindow::named("w").with_defaults(RunOptions {
                model: Some("gpt-5".into()),
                working_directory: Some("/repo".into()),
                ..Default::default()
            }))
            .unwrap();

        let updated = deck
            .set_default_options(
                &window.id,
                &RunOptions {
                    model: Some("".into()),
                    sandbox_mode: Some("read-only".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.default_run_options.model.as_deref(), Some("gpt-5"));
        assert_eq!(
            updated.default_run_options.sandbox_mode.as_deref(),
            Some("read-only")
        );
    }

    #[tokio::test]
    async fn test_list_windows_is_ordered() {
        let dir = TempDir::new().unwrap();
        let deck = orchestrator(&dir);
        let a = deck.create_window(NewWindow::named("a")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = deck.create_window(NewWindow::named("b")).unwrap();
        let ids: Vec<String> = deck.list_windows().into_iter().map(|w| w.id).collect();
        assert_eq!(ids, vec![a.id, b.id]);
    }
}
