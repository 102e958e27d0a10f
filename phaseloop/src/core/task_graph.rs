//! Structured plans: tasks with dependencies grouped into execution waves.
//!
//! A task's wave is one more than the highest wave among its dependencies;
//! tasks without dependencies are wave 1. Waves are computed with Kahn's
//! algorithm, so a cycle is detected as the set of tasks never released.
//! Dependencies on ids that are not in the plan are ignored.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::WaveError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Skipped,
}

impl TaskStatus {
    /// Completed and skipped tasks no longer need work.
    pub fn is_settled(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Skipped)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    /// Wave recorded by whoever wrote the plan; recomputed, never trusted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wave: Option<u32>,
}

/// Ordered set of tasks read from `plan.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredPlan {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
    pub tasks: Vec<Task>,
}

/// Tasks that can run together once earlier waves are settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wave<'a> {
    pub number: u32,
    pub tasks: Vec<&'a Task>,
}

/// Compute the wave of every task, keyed by task id.
///
/// On a cycle, [`WaveError::Cycle`] lists every task that was never
/// released: the tasks on the cycle plus any task that depends on them.
pub fn compute_waves(tasks: &[Task]) -> Result<BTreeMap<String, u32>, WaveError> {
    let mut index: BTreeMap<&str, usize> = BTreeMap::new();
    for (idx, task) in tasks.iter().enumerate() {
        if index.insert(task.id.as_str(), idx).is_some() {
            return Err(WaveError::DuplicateId(task.id.clone()));
        }
    }

    let mut in_degree = vec![0usize; tasks.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); tasks.len()];
    for (idx, task) in tasks.iter().enumerate() {
        // Repeated dependency ids count once.
        let deps: BTreeSet<&str> = task.depends_on.iter().map(String::as_str).collect();
        for dep in deps {
            let Some(&dep_idx) = index.get(dep) else {
                debug!(task = %task.id, dependency = dep, "ignoring unknown dependency");
                continue;
            };
            in_degree[idx] += 1;
            dependents[dep_idx].push(idx);
        }
    }

    let mut wave = vec![1u32; tasks.len()];
    let mut ready: VecDeque<usize> = (0..tasks.len()).filter(|idx| in_degree[*idx] == 0).collect();
    let mut released = 0usize;
    while let Some(idx) = ready.pop_front() {
        released += 1;
        for &next in &dependents[idx] {
            wave[next] = wave[next].max(wave[idx] + 1);
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push_back(next);
            }
        }
    }

    if released < tasks.len() {
        let mut task_ids: Vec<String> = tasks
            .iter()
            .enumerate()
            .filter(|(idx, _)| in_degree[*idx] > 0)
            .map(|(_, task)| task.id.clone())
            .collect();
        task_ids.sort();
        return Err(WaveError::Cycle { task_ids });
    }

    Ok(tasks
        .iter()
        .zip(wave)
        .map(|(task, wave)| (task.id.clone(), wave))
        .collect())
}

impl StructuredPlan {
    /// All waves in ascending order, tasks in plan order within a wave.
    pub fn waves(&self) -> Result<Vec<Wave<'_>>, WaveError> {
        let numbers = compute_waves(&self.tasks)?;
        let mut grouped: BTreeMap<u32, Vec<&Task>> = BTreeMap::new();
        for task in &self.tasks {
            let number = numbers.get(&task.id).copied().unwrap_or(1);
            grouped.entry(number).or_default().push(task);
        }
        Ok(grouped
            .into_iter()
            .map(|(number, tasks)| Wave { number, tasks })
            .collect())
    }

    /// First wave that still holds unsettled tasks, restricted to those tasks.
    pub fn next_wave(&self) -> Result<Option<Wave<'_>>, WaveError> {
        Ok(self.waves()?.into_iter().find_map(|wave| {
            let open: Vec<&Task> = wave
                .tasks
                .into_iter()
                .filter(|task| !task.status.is_settled())
                .collect();
            (!open.is_empty()).then_some(Wave {
                number: wave.number,
                tasks: open,
            })
        }))
    }

    pub fn is_complete(&self) -> bool {
        self.tasks.iter().all(|task| task.status.is_settled())
    }

    /// Percentage of settled tasks; an empty plan is fully complete.
    pub fn completion_percentage(&self) -> f64 {
        if self.tasks.is_empty() {
            return 100.0;
        }
        let settled = self
            .tasks
            .iter()
            .filter(|task| task.status.is_settled())
            .count();
        settled as f64 * 100.0 / self.tasks.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, deps: &[&str]) -> Task {
        Task {
            id: id.to_string(),
            name: format!("{id} name"),
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            status: TaskStatus::Pending,
            files: Vec::new(),
            wave: None,
        }
    }

    #[test]
    fn independent_tasks_are_wave_one() {
        let waves = compute_waves(&[task("a", &[]), task("b", &[])]).expect("waves");
        assert_eq!(waves["a"], 1);
        assert_eq!(waves["b"], 1);
    }

    /// Diamond plus a long chain: every wave is 1 + max(dependency waves).
    #[test]
    fn wave_is_one_more_than_deepest_dependency() {
        let tasks = vec![
            task("d", &["b", "c"]),
            task("a", &[]),
            task("b", &["a"]),
            task("c", &["a", "a"]),
            task("e", &["a", "d"]),
        ];
        let waves = compute_waves(&tasks).expect("waves");
        for t in &tasks {
            let expected = t
                .depends_on
                .iter()
                .map(|dep| waves[dep])
                .max()
                .map_or(1, |max| max + 1);
            assert_eq!(waves[&t.id], expected, "task {}", t.id);
        }
        assert_eq!(waves["e"], 4);
    }

    #[test]
    fn cycles_name_the_involved_tasks() {
        let tasks = vec![
            task("root", &[]),
            task("x", &["root", "z"]),
            task("y", &["x"]),
            task("z", &["y"]),
            task("tail", &["z"]),
        ];
        let err = compute_waves(&tasks).unwrap_err();
        assert_eq!(
            err,
            WaveError::Cycle {
                task_ids: vec![
                    "tail".to_string(),
                    "x".to_string(),
                    "y".to_string(),
                    "z".to_string()
                ]
            }
        );
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let err = compute_waves(&[task("a", &["a"])]).unwrap_err();
        assert_eq!(
            err,
            WaveError::Cycle {
                task_ids: vec!["a".to_string()]
            }
        );
    }

    #[test]
    fn unknown_dependencies_are_ignored() {
        let waves =
            compute_waves(&[task("a", &["ghost"]), task("b", &["a", "removed"])]).expect("waves");
        assert_eq!(waves["a"], 1);
        assert_eq!(waves["b"], 2);
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let err = compute_waves(&[task("a", &[]), task("a", &[])]).unwrap_err();
        assert_eq!(err, WaveError::DuplicateId("a".to_string()));
    }

    #[test]
    fn next_wave_skips_settled_tasks() {
        let mut plan = StructuredPlan {
            goal: None,
            tasks: vec![task("a", &[]), task("b", &[]), task("c", &["a"])],
        };
        plan.tasks[0].status = TaskStatus::Completed;
        plan.tasks[1].status = TaskStatus::Skipped;

        let next = plan.next_wave().expect("waves").expect("open wave");
        assert_eq!(next.number, 2);
        assert_eq!(next.tasks.len(), 1);
        assert_eq!(next.tasks[0].id, "c");
        assert!((plan.completion_percentage() - 200.0 / 3.0).abs() < 1e-9);

        plan.tasks[2].status = TaskStatus::Completed;
        assert!(plan.next_wave().expect("waves").is_none());
        assert!(plan.is_complete());
    }

    #[test]
    fn empty_plan_is_complete() {
        let plan = StructuredPlan::default();
        assert!(plan.is_complete());
        assert_eq!(plan.completion_percentage(), 100.0);
        assert!(plan.waves().expect("waves").is_empty());
    }
}
