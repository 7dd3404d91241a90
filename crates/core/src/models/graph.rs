use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::errors::{GridError, GridResult};

/// 作业内任务间的依赖关系，以任务位置为键
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskGraph {
    dependencies: BTreeMap<usize, BTreeSet<usize>>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// `task` 依赖 `depends_on`
    pub fn add_dependency(mut self, task: usize, depends_on: usize) -> Self {
        self.dependencies.entry(task).or_default().insert(depends_on);
        self
    }

    pub fn dependencies_of(&self, task: usize) -> impl Iterator<Item = usize> + '_ {
        self.dependencies
            .get(&task)
            .into_iter()
            .flat_map(|deps| deps.iter().copied())
    }

    /// 所有依赖均已到达终态时可以分发
    pub fn is_ready(&self, task: usize, is_terminal: impl Fn(usize) -> bool) -> bool {
        self.dependencies_of(task).all(is_terminal)
    }

    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }

    /// 检查位置范围、自依赖与环
    pub fn validate(&self, task_count: usize) -> GridResult<()> {
        for (&task, deps) in &self.dependencies {
            if task >= task_count {
                return Err(GridError::InvalidTaskGraph(format!(
                    "任务位置 {task} 超出范围 {task_count}"
                )));
            }
            for &dep in deps {
                if dep >= task_count {
                    return Err(GridError::InvalidTaskGraph(format!(
                        "依赖位置 {dep} 超出范围 {task_count}"
                    )));
                }
                if dep == task {
                    return Err(GridError::CircularDependency);
                }
            }
        }

        // 0: 未访问, 1: 访问中, 2: 已完成
        let mut marks = vec![0u8; task_count];
        for &start in self.dependencies.keys() {
            if marks[start] != 0 {
                continue;
            }
            let mut stack: Vec<(usize, Vec<usize>)> =
                vec![(start, self.dependencies_of(start).collect())];
            marks[start] = 1;
            while let Some((node, pending)) = stack.last_mut() {
                match pending.pop() {
                    Some(next) => match marks[next] {
                        1 => return Err(GridError::CircularDependency),
                        0 => {
                            marks[next] = 1;
                            let deps = self.dependencies_of(next).collect();
                            stack.push((next, deps));
                        }
                        _ => {}
                    },
                    None => {
                        marks[*node] = 2;
                        stack.pop();
                    }
                }
            }
        }
        Ok(())
    }
}
