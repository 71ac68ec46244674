//! Process registry.
//!
//! Holds the container id, bundle path and every tracked process behind one
//! lock. Critical sections only read or mutate the map; anything slow
//! (runtime calls, mounts, waiting for exits) happens after the lock is
//! released on a cloned handle.

use crate::process::{Exit, InitProcess, Process, TrackedProcess};
use gvshim_shared::errors::{ShimError, ShimResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Default)]
struct RegistryState {
    container_id: String,
    bundle: PathBuf,
    processes: HashMap<String, TrackedProcess>,
    /// A Create call is between reservation and commit.
    creating: bool,
    /// Ids with a Start in flight, and the exits that arrived meanwhile.
    starting: HashMap<String, StartHold>,
}

#[derive(Default)]
struct StartHold {
    starters: usize,
    held: Vec<Exit>,
}

impl RegistryState {
    fn init(&self) -> Option<&Arc<dyn InitProcess>> {
        match self.processes.get(&self.container_id) {
            Some(TrackedProcess::Init(init)) => Some(init),
            _ => None,
        }
    }
}

/// Registry of the container's processes.
#[derive(Default)]
pub(crate) struct ProcessRegistry {
    state: Mutex<RegistryState>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Container id, empty before Create.
    pub fn container_id(&self) -> String {
        self.state.lock().container_id.clone()
    }

    pub fn bundle(&self) -> PathBuf {
        self.state.lock().bundle.clone()
    }

    /// The container's init process.
    pub fn init(&self) -> ShimResult<Arc<dyn InitProcess>> {
        self.state
            .lock()
            .init()
            .cloned()
            .ok_or_else(|| ShimError::FailedPrecondition("container must be created".into()))
    }

    /// Any tracked process by id.
    pub fn get(&self, id: &str) -> ShimResult<TrackedProcess> {
        self.state
            .lock()
            .processes
            .get(id)
            .cloned()
            .ok_or_else(|| ShimError::NotFound(format!("process {} does not exist", id)))
    }

    /// Check that `exec_id` can be exec'd and return the init process to exec through.
    pub fn init_for_exec(&self, exec_id: &str) -> ShimResult<Arc<dyn InitProcess>> {
        let state = self.state.lock();
        if state.processes.contains_key(exec_id) {
            return Err(ShimError::AlreadyExists(format!(
                "id {} already exists",
                exec_id
            )));
        }
        state
            .init()
            .cloned()
            .ok_or_else(|| ShimError::FailedPrecondition("container must be created".into()))
    }

    /// Track a new exec process. Fails if its id got taken in the meantime.
    pub fn insert_exec(&self, process: Arc<dyn Process>) -> ShimResult<()> {
        let mut state = self.state.lock();
        let id = process.id().to_string();
        if state.processes.contains_key(&id) {
            return Err(ShimError::AlreadyExists(format!("id {} already exists", id)));
        }
        state.processes.insert(id, TrackedProcess::Exec(process));
        Ok(())
    }

    /// Claim the single Create slot of this shim.
    pub fn reserve_create(&self) -> ShimResult<CreateReservation<'_>> {
        let mut state = self.state.lock();
        if state.creating || state.init().is_some() {
            return Err(ShimError::AlreadyExists(format!(
                "container {} already exists",
                state.container_id
            )));
        }
        state.creating = true;
        Ok(CreateReservation {
            registry: self,
            committed: false,
        })
    }

    /// Stop tracking `id`.
    pub fn remove(&self, id: &str) -> Option<TrackedProcess> {
        self.state.lock().processes.remove(id)
    }

    /// Copy of every tracked process.
    pub fn snapshot(&self) -> Vec<TrackedProcess> {
        self.state.lock().processes.values().cloned().collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.state.lock().processes.contains_key(id)
    }

    /// Mark a Start of `id` as in flight. Exits for `id` are held until
    /// [`ProcessRegistry::finish_start`].
    pub fn begin_start(&self, id: &str) {
        self.state
            .lock()
            .starting
            .entry(id.to_string())
            .or_default()
            .starters += 1;
    }

    /// End a Start of `id`. Returns the held exits once no Start of `id` is left.
    pub fn finish_start(&self, id: &str) -> Vec<Exit> {
        let mut state = self.state.lock();
        let Some(hold) = state.starting.get_mut(id) else {
            return Vec::new();
        };
        hold.starters -= 1;
        if hold.starters > 0 {
            return Vec::new();
        }
        state
            .starting
            .remove(id)
            .map(|hold| hold.held)
            .unwrap_or_default()
    }

    /// Hold `exit` if its process is being started, otherwise hand it back.
    pub fn hold_exit(&self, exit: Exit) -> Option<Exit> {
        let mut state = self.state.lock();
        match state.starting.get_mut(&exit.id) {
            Some(hold) => {
                hold.held.push(exit);
                None
            }
            None => Some(exit),
        }
    }

    /// Id of each tracked process, keyed by pid.
    pub fn ids_by_pid(&self) -> HashMap<u32, String> {
        self.state
            .lock()
            .processes
            .values()
            .map(|p| p.process())
            .filter(|p| p.pid() != 0)
            .map(|p| (p.pid(), p.id().to_string()))
            .collect()
    }
}

/// Held by a Create call in progress. Releases the slot on drop unless committed.
pub(crate) struct CreateReservation<'a> {
    registry: &'a ProcessRegistry,
    committed: bool,
}

impl CreateReservation<'_> {
    /// Record the container and its init process.
    pub fn commit(mut self, id: &str, bundle: &Path, init: Arc<dyn InitProcess>) {
        let mut state = self.registry.state.lock();
        state.container_id = id.to_string();
        state.bundle = bundle.to_path_buf();
        state
            .processes
            .insert(id.to_string(), TrackedProcess::Init(init));
        state.creating = false;
        self.committed = true;
    }
}

impl Drop for CreateReservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.registry.state.lock().creating = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exit(id: &str, status: i32) -> Exit {
        Exit {
            id: id.to_string(),
            pid: 100,
            status,
        }
    }

    #[test]
    fn test_exits_pass_through_without_start() {
        let registry = ProcessRegistry::new();
        assert_eq!(registry.hold_exit(exit("c1", 0)), Some(exit("c1", 0)));
        assert!(registry.finish_start("c1").is_empty());
    }

    #[test]
    fn test_exit_held_until_last_start_finishes() {
        let registry = ProcessRegistry::new();
        registry.begin_start("c1");
        registry.begin_start("c1");

        assert_eq!(registry.hold_exit(exit("c1", 137)), None);
        // Other ids are not affected.
        assert_eq!(registry.hold_exit(exit("e1", 1)), Some(exit("e1", 1)));

        assert!(registry.finish_start("c1").is_empty());
        assert_eq!(registry.finish_start("c1"), vec![exit("c1", 137)]);
        assert_eq!(registry.hold_exit(exit("c1", 0)), Some(exit("c1", 0)));
    }
}
