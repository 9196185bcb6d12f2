//! Board data model shared by the server and clients.
//!
//! A board is a set of named tabs, each holding exactly three fixed columns
//! of tasks. Within a column, tasks are ordered by `pos`; every structural
//! change renormalizes the column back to dense integers `1..=n`.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Calendar format accepted for task due dates.
pub const DUE_DATE_FORMAT: &str = "%Y-%m-%d";

/// Gap below which [`position_between`] stops halving and nudges instead.
const MIN_POSITION_GAP: f64 = 1e-6;

/// One of the three fixed board columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Column {
    /// Not started.
    #[default]
    Todo,
    /// Being worked on.
    #[serde(rename = "inprogress")]
    InProgress,
    /// Finished.
    Done,
}

impl Column {
    /// All columns in display order.
    pub const ALL: [Self; 3] = [Self::Todo, Self::InProgress, Self::Done];

    /// Wire name of the column.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::InProgress => "inprogress",
            Self::Done => "done",
        }
    }
}

impl std::fmt::Display for Column {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string names no known column or priority.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value:?}")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

impl FromStr for Column {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "todo" => Ok(Self::Todo),
            "inprogress" => Ok(Self::InProgress),
            "done" => Ok(Self::Done),
            other => Err(ParseEnumError {
                kind: "column",
                value: other.to_string(),
            }),
        }
    }
}

/// Task priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Priority {
    /// Urgent.
    High,
    /// The default for new tasks.
    #[default]
    Medium,
    /// Can wait.
    Low,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::High => write!(f, "High"),
            Self::Medium => write!(f, "Medium"),
            Self::Low => write!(f, "Low"),
        }
    }
}

impl FromStr for Priority {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "High" => Ok(Self::High),
            "Medium" => Ok(Self::Medium),
            "Low" => Ok(Self::Low),
            other => Err(ParseEnumError {
                kind: "priority",
                value: other.to_string(),
            }),
        }
    }
}

/// Parses a `YYYY-MM-DD` due date, returning `None` for anything else.
#[must_use]
pub fn parse_due_date(value: &str) -> Option<NaiveDate> {
    let trimmed = value.trim();
    // chrono accepts unpadded fields; the wire format is strictly zero-padded.
    if trimmed.len() != 10 {
        return None;
    }
    NaiveDate::parse_from_str(trimmed, DUE_DATE_FORMAT).ok()
}

/// A single card on the board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Stable identifier, unique within the board.
    pub id: String,
    /// Free text body.
    pub content: String,
    /// Optional calendar due date.
    #[serde(rename = "dueDate")]
    pub due_date: Option<NaiveDate>,
    /// Priority, `Medium` unless set.
    pub priority: Priority,
    /// Ordering key within the column (dense `1..=n` at rest).
    pub pos: f64,
    /// Last-modified timestamp, milliseconds since epoch.
    pub upd: u64,
    /// Actor that last modified the task.
    pub by: Option<String>,
}

/// A tab: exactly the three fixed columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tab {
    /// Tasks not yet started.
    pub todo: Vec<Task>,
    /// Tasks in progress.
    pub inprogress: Vec<Task>,
    /// Finished tasks.
    pub done: Vec<Task>,
}

impl Tab {
    /// Returns the tasks of a column in order.
    #[must_use]
    pub fn column(&self, column: Column) -> &[Task] {
        match column {
            Column::Todo => &self.todo,
            Column::InProgress => &self.inprogress,
            Column::Done => &self.done,
        }
    }

    /// Returns the tasks of a column for mutation.
    pub const fn column_mut(&mut self, column: Column) -> &mut Vec<Task> {
        match column {
            Column::Todo => &mut self.todo,
            Column::InProgress => &mut self.inprogress,
            Column::Done => &mut self.done,
        }
    }

    /// Returns `true` if no column holds a task.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        Column::ALL.iter().all(|c| self.column(*c).is_empty())
    }
}

/// Where a task currently lives on the board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskLocation {
    /// Tab name.
    pub tab: String,
    /// Column within the tab.
    pub column: Column,
    /// Index within the column.
    pub index: usize,
}

/// The materialized state of a workspace: tab name to tab.
///
/// Tabs are kept in a [`BTreeMap`] so iteration (and therefore "first match"
/// lookups and serialized output) is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BoardState {
    tabs: BTreeMap<String, Tab>,
}

impl BoardState {
    /// Creates an empty board.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a board from existing tabs, sanitizing column order.
    #[must_use]
    pub fn from_tabs(tabs: BTreeMap<String, Tab>) -> Self {
        let mut board = Self { tabs };
        board.sanitize();
        board
    }

    /// Returns a tab by name.
    #[must_use]
    pub fn tab(&self, name: &str) -> Option<&Tab> {
        self.tabs.get(name)
    }

    /// Iterates over tabs in name order.
    pub fn tabs(&self) -> impl Iterator<Item = (&String, &Tab)> {
        self.tabs.iter()
    }

    /// Number of tabs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tabs.len()
    }

    /// Returns `true` if the board has no tabs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tabs.is_empty()
    }

    /// Returns `true` if a tab with this name exists.
    #[must_use]
    pub fn contains_tab(&self, name: &str) -> bool {
        self.tabs.contains_key(name)
    }

    /// Returns the named tab, creating it with empty columns if needed.
    pub fn ensure_tab(&mut self, name: &str) -> &mut Tab {
        self.tabs.entry(name.to_string()).or_default()
    }

    pub(crate) fn tab_mut(&mut self, name: &str) -> Option<&mut Tab> {
        self.tabs.get_mut(name)
    }

    pub(crate) fn remove_tab(&mut self, name: &str) -> Option<Tab> {
        self.tabs.remove(name)
    }

    pub(crate) fn insert_tab(&mut self, name: String, tab: Tab) {
        self.tabs.insert(name, tab);
    }

    /// Finds the first task with `id`, scanning tabs in name order and
    /// columns in display order.
    #[must_use]
    pub fn locate(&self, id: &str) -> Option<TaskLocation> {
        self.tabs.iter().find_map(|(name, tab)| {
            Column::ALL.iter().find_map(|column| {
                tab.column(*column)
                    .iter()
                    .position(|t| t.id == id)
                    .map(|index| TaskLocation {
                        tab: name.clone(),
                        column: *column,
                        index,
                    })
            })
        })
    }

    /// Returns the first task with `id`.
    #[must_use]
    pub fn task(&self, id: &str) -> Option<&Task> {
        let loc = self.locate(id)?;
        self.tabs
            .get(&loc.tab)
            .and_then(|tab| tab.column(loc.column).get(loc.index))
    }

    /// Total number of tasks across all tabs.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.tabs
            .values()
            .map(|tab| Column::ALL.iter().map(|c| tab.column(*c).len()).sum::<usize>())
            .sum()
    }

    /// Sorts every column by `pos` and renormalizes it.
    ///
    /// Applied to boards that did not come out of the reducer (loaded from
    /// storage or received from a peer), which may carry stale keys.
    pub fn sanitize(&mut self) {
        for tab in self.tabs.values_mut() {
            for column in Column::ALL {
                let list = tab.column_mut(column);
                list.sort_by(|a, b| a.pos.total_cmp(&b.pos));
                renormalize(list);
            }
        }
    }
}

/// Rewrites `pos` of every task to its 1-based index.
#[allow(clippy::cast_precision_loss)]
pub fn renormalize(list: &mut [Task]) {
    for (i, task) in list.iter_mut().enumerate() {
        task.pos = (i + 1) as f64;
    }
}

/// Inserts `task` before the first task whose `pos` is strictly greater,
/// appending when `pos` is not finite, then renormalizes the column.
pub fn insert_by_position(list: &mut Vec<Task>, task: Task) {
    let index = if task.pos.is_finite() {
        list.iter()
            .position(|t| t.pos > task.pos)
            .unwrap_or(list.len())
    } else {
        list.len()
    };
    list.insert(index, task);
    renormalize(list);
}

/// Computes an ordering key strictly between two neighbors.
///
/// `prev = None` means "start of column" and `next = None` means "end of
/// column". Used by clients to place a task between existing ones.
#[must_use]
pub fn position_between(prev: Option<f64>, next: Option<f64>) -> f64 {
    let a = prev.filter(|p| p.is_finite()).unwrap_or(0.0);
    let b = next.filter(|n| n.is_finite()).unwrap_or(a + 2.0);
    if b - a > MIN_POSITION_GAP {
        a + (b - a) / 2.0
    } else {
        a + MIN_POSITION_GAP
    }
}
