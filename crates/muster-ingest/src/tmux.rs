//! tmux-backed pane source.

use crate::watcher::{MapMode, PaneSource, PaneTarget};
use muster_core::AGENT_ROSTER;
use std::collections::BTreeMap;
use std::process::Command;
use tracing::debug;

const WINDOW_FORMAT: &str = "#{window_index}::#{window_name}";
const PANE_FORMAT: &str = "#{pane_id}::#{pane_title}::#{pane_current_command}::#{window_name}";

/// One row of `list-windows` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowInfo {
    pub index: String,
    pub name: String,
}

/// One row of `list-panes` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaneInfo {
    pub pane_id: String,
    pub title: String,
    pub command: String,
    pub window_name: String,
}

/// Shells out to the tmux binary. Any failure (missing binary, dead server,
/// unknown target) reads as empty output rather than an error.
#[derive(Debug, Clone, Copy, Default)]
pub struct TmuxProbe;

impl TmuxProbe {
    fn run_tmux(&self, args: &[&str]) -> String {
        match Command::new("tmux").args(args).output() {
            Ok(output) if output.status.success() => {
                String::from_utf8_lossy(&output.stdout).trim().to_string()
            }
            Ok(output) => {
                debug!("tmux {args:?} exited with {}", output.status);
                String::new()
            }
            Err(err) => {
                debug!("tmux {args:?} did not run: {err}");
                String::new()
            }
        }
    }

    pub fn list_windows(&self, session: &str) -> Vec<WindowInfo> {
        parse_windows(&self.run_tmux(&["list-windows", "-t", session, "-F", WINDOW_FORMAT]))
    }

    /// All panes of the session, across every window.
    pub fn list_panes(&self, session: &str) -> Vec<PaneInfo> {
        parse_panes(&self.run_tmux(&["list-panes", "-s", "-t", session, "-F", PANE_FORMAT]))
    }

    fn pane_option(&self, agent: &str) -> String {
        let name = format!("@muster_pane_{agent}");
        self.run_tmux(&["show-option", "-gqv", &name])
    }
}

impl PaneSource for TmuxProbe {
    /// Resolve the agent-to-pane mapping in three stages: a window named
    /// after every roster agent wins outright; otherwise panes tagged via
    /// `@muster_pane_<agent>` session options, then panes whose title or
    /// running command mentions the agent.
    fn map_agents(&self, session: &str) -> BTreeMap<String, PaneTarget> {
        let mut mapping = BTreeMap::new();

        let windows = self.list_windows(session);
        if AGENT_ROSTER
            .iter()
            .all(|agent| windows.iter().any(|window| window.name == *agent))
        {
            let panes = self.list_panes(session);
            for agent in AGENT_ROSTER {
                if let Some(pane) = panes.iter().find(|pane| pane.window_name == agent) {
                    mapping.insert(
                        agent.to_string(),
                        PaneTarget {
                            pane_id: pane.pane_id.clone(),
                            window_name: agent.to_string(),
                            mode: MapMode::Windows,
                        },
                    );
                }
            }
            return mapping;
        }

        let panes = self.list_panes(session);
        for agent in AGENT_ROSTER {
            let tag = self.pane_option(agent);
            if tag.is_empty() {
                continue;
            }
            if let Some(pane) = panes
                .iter()
                .find(|pane| pane.pane_id == tag || pane.window_name == tag)
            {
                mapping.insert(
                    agent.to_string(),
                    PaneTarget {
                        pane_id: pane.pane_id.clone(),
                        window_name: pane.window_name.clone(),
                        mode: MapMode::Panes,
                    },
                );
            }
        }

        for agent in AGENT_ROSTER {
            if mapping.contains_key(agent) {
                continue;
            }
            if let Some(pane) = panes.iter().find(|pane| {
                pane.title.to_lowercase().contains(agent)
                    || pane.command.to_lowercase().contains(agent)
            }) {
                mapping.insert(
                    agent.to_string(),
                    PaneTarget {
                        pane_id: pane.pane_id.clone(),
                        window_name: pane.window_name.clone(),
                        mode: MapMode::Panes,
                    },
                );
            }
        }

        mapping
    }

    fn capture_pane(&self, pane_id: &str, lines: u32) -> String {
        let depth = format!("-{lines}");
        self.run_tmux(&["capture-pane", "-p", "-t", pane_id, "-S", &depth])
    }
}

fn parse_windows(output: &str) -> Vec<WindowInfo> {
    output
        .lines()
        .filter_map(|line| {
            let (index, name) = line.split_once("::")?;
            Some(WindowInfo {
                index: index.to_string(),
                name: name.to_string(),
            })
        })
        .collect()
}

fn parse_panes(output: &str) -> Vec<PaneInfo> {
    output
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split("::").collect();
            if parts.len() < 4 {
                return None;
            }
            Some(PaneInfo {
                pane_id: parts[0].to_string(),
                title: parts[1].to_string(),
                command: parts[2].to_string(),
                window_name: parts[3].to_string(),
            })
        })
        .collect()
}
