//! In-memory [GeneratorRepository]: one mutex over the whole store, so every
//! write is atomic with respect to every read.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use crate::error::KernelError;
use crate::identity::{AgentRef, GeneratorId, RealmRef, RuleId, TaskHandle};
use crate::models::{
    GenerationTime, Generator, GeneratorConfig, Pause, Ready, ScheduleUpdate, StoredRule,
};
use crate::recurrence::RecurrenceRule;
use crate::repository::GeneratorRepository;

#[derive(Default)]
struct StoreState {
    last_generator_id: GeneratorId,
    last_rule_id: RuleId,
    generators: BTreeMap<GeneratorId, Generator>,
    rules: Vec<StoredRule>,
    pauses: Vec<Pause>,
    readies: Vec<Ready>,
    log: Vec<GenerationTime>,
}

impl StoreState {
    fn generator_mut(&mut self, id: GeneratorId) -> Result<&mut Generator, KernelError> {
        self.generators
            .get_mut(&id)
            .ok_or(KernelError::GeneratorNotFound(id))
    }

    fn ensure_exists(&self, id: GeneratorId) -> Result<(), KernelError> {
        if self.generators.contains_key(&id) {
            Ok(())
        } else {
            Err(KernelError::GeneratorNotFound(id))
        }
    }
}

#[derive(Default)]
pub struct InMemoryGeneratorRepository {
    state: Mutex<StoreState>,
}

impl InMemoryGeneratorRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, StoreState>, KernelError> {
        self.state
            .lock()
            .map_err(|e| KernelError::Driver(format!("generator store poisoned: {e}")))
    }
}

impl GeneratorRepository for InMemoryGeneratorRepository {
    fn create_generator(
        &self,
        realm: &RealmRef,
        config: &GeneratorConfig,
    ) -> Result<Generator, KernelError> {
        let mut state = self.state()?;
        if state.generators.values().any(|g| &g.realm == realm) {
            return Err(KernelError::GeneratorExists(realm.clone()));
        }
        state.last_generator_id += 1;
        let generator = Generator {
            id: state.last_generator_id,
            realm: realm.clone(),
            generating: false,
            generation_time: None,
            task_handle: None,
            config: config.clone(),
        };
        state.generators.insert(generator.id, generator.clone());
        Ok(generator)
    }

    fn get_generator(&self, id: GeneratorId) -> Result<Option<Generator>, KernelError> {
        Ok(self.state()?.generators.get(&id).cloned())
    }

    fn find_generator(&self, realm: &RealmRef) -> Result<Option<Generator>, KernelError> {
        Ok(self
            .state()?
            .generators
            .values()
            .find(|g| &g.realm == realm)
            .cloned())
    }

    fn list_generators(&self) -> Result<Vec<Generator>, KernelError> {
        Ok(self.state()?.generators.values().cloned().collect())
    }

    fn update_config(
        &self,
        id: GeneratorId,
        config: &GeneratorConfig,
    ) -> Result<(), KernelError> {
        let mut state = self.state()?;
        state.generator_mut(id)?.config = config.clone();
        Ok(())
    }

    fn delete_generator(&self, id: GeneratorId) -> Result<bool, KernelError> {
        let mut state = self.state()?;
        if state.generators.remove(&id).is_none() {
            return Ok(false);
        }
        state.rules.retain(|r| r.generator_id != id);
        state.pauses.retain(|p| p.generator_id != id);
        state.readies.retain(|r| r.generator_id != id);
        state.log.retain(|t| t.generator_id != id);
        Ok(true)
    }

    fn add_rule(&self, id: GeneratorId, rule: &RecurrenceRule) -> Result<StoredRule, KernelError> {
        let mut state = self.state()?;
        state.ensure_exists(id)?;
        state.last_rule_id += 1;
        let stored = StoredRule {
            id: state.last_rule_id,
            generator_id: id,
            rule: rule.clone(),
        };
        state.rules.push(stored.clone());
        Ok(stored)
    }

    fn remove_rule(&self, id: GeneratorId, rule_id: RuleId) -> Result<bool, KernelError> {
        let mut state = self.state()?;
        let before = state.rules.len();
        state
            .rules
            .retain(|r| !(r.generator_id == id && r.id == rule_id));
        Ok(state.rules.len() != before)
    }

    fn list_rules(&self, id: GeneratorId) -> Result<Vec<StoredRule>, KernelError> {
        Ok(self
            .state()?
            .rules
            .iter()
            .filter(|r| r.generator_id == id)
            .cloned()
            .collect())
    }

    fn add_pause(&self, pause: &Pause) -> Result<(), KernelError> {
        let mut state = self.state()?;
        state.ensure_exists(pause.generator_id)?;
        if state
            .pauses
            .iter()
            .any(|p| p.generator_id == pause.generator_id && p.agent == pause.agent)
        {
            return Err(KernelError::AlreadyPaused(pause.agent.clone()));
        }
        state.pauses.push(pause.clone());
        Ok(())
    }

    fn remove_pause(&self, id: GeneratorId, agent: &AgentRef) -> Result<bool, KernelError> {
        let mut state = self.state()?;
        let before = state.pauses.len();
        state
            .pauses
            .retain(|p| !(p.generator_id == id && &p.agent == agent));
        Ok(state.pauses.len() != before)
    }

    fn list_pauses(&self, id: GeneratorId) -> Result<Vec<Pause>, KernelError> {
        Ok(self
            .state()?
            .pauses
            .iter()
            .filter(|p| p.generator_id == id)
            .cloned()
            .collect())
    }

    fn add_ready(&self, ready: &Ready) -> Result<(), KernelError> {
        let mut state = self.state()?;
        state.ensure_exists(ready.generator_id)?;
        if state
            .readies
            .iter()
            .any(|r| r.generator_id == ready.generator_id && r.agent == ready.agent)
        {
            return Err(KernelError::AlreadyReady(ready.agent.clone()));
        }
        state.readies.push(ready.clone());
        Ok(())
    }

    fn remove_ready(&self, id: GeneratorId, agent: &AgentRef) -> Result<bool, KernelError> {
        let mut state = self.state()?;
        let before = state.readies.len();
        state
            .readies
            .retain(|r| !(r.generator_id == id && &r.agent == agent));
        Ok(state.readies.len() != before)
    }

    fn list_readies(&self, id: GeneratorId) -> Result<Vec<Ready>, KernelError> {
        Ok(self
            .state()?
            .readies
            .iter()
            .filter(|r| r.generator_id == id)
            .cloned()
            .collect())
    }

    fn clear_readies(&self, id: GeneratorId) -> Result<u64, KernelError> {
        let mut state = self.state()?;
        let before = state.readies.len();
        state.readies.retain(|r| r.generator_id != id);
        Ok((before - state.readies.len()) as u64)
    }

    fn append_generation_time(
        &self,
        id: GeneratorId,
        timestamp: DateTime<Utc>,
    ) -> Result<GenerationTime, KernelError> {
        let mut state = self.state()?;
        state.ensure_exists(id)?;
        let entry = GenerationTime {
            generator_id: id,
            timestamp,
        };
        state.log.push(entry.clone());
        Ok(entry)
    }

    fn list_generation_times(&self, id: GeneratorId) -> Result<Vec<GenerationTime>, KernelError> {
        let state = self.state()?;
        let mut entries: Vec<GenerationTime> = state
            .log
            .iter()
            .rev()
            .filter(|t| t.generator_id == id)
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(entries)
    }

    fn try_acquire_lock(&self, id: GeneratorId) -> Result<bool, KernelError> {
        let mut state = self.state()?;
        match state.generators.get_mut(&id) {
            Some(generator) if !generator.generating => {
                generator.generating = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn release_lock(
        &self,
        id: GeneratorId,
        expected: Option<&TaskHandle>,
        schedule: &ScheduleUpdate,
    ) -> Result<bool, KernelError> {
        let mut state = self.state()?;
        let generator = state.generator_mut(id)?;
        generator.generating = false;
        if *schedule == ScheduleUpdate::Keep {
            return Ok(true);
        }
        if generator.task_handle.as_ref() != expected {
            return Ok(false);
        }
        let (handle, eta) =
            schedule.apply(generator.task_handle.take(), generator.generation_time.take());
        generator.task_handle = handle;
        generator.generation_time = eta;
        Ok(true)
    }

    fn replace_schedule(
        &self,
        id: GeneratorId,
        expected: Option<&TaskHandle>,
        schedule: &ScheduleUpdate,
    ) -> Result<bool, KernelError> {
        let mut state = self.state()?;
        let generator = state.generator_mut(id)?;
        if generator.task_handle.as_ref() != expected {
            return Ok(false);
        }
        let (handle, eta) =
            schedule.apply(generator.task_handle.take(), generator.generation_time.take());
        generator.task_handle = handle;
        generator.generation_time = eta;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};

    use chrono::Duration;

    use super::*;

    fn realm() -> RealmRef {
        RealmRef::new("testrealm", 1)
    }

    fn agent(id: u64) -> AgentRef {
        AgentRef::new("testagent", id)
    }

    #[test]
    fn generator_is_unique_per_realm() {
        let repo = InMemoryGeneratorRepository::new();
        repo.create_generator(&realm(), &GeneratorConfig::default())
            .unwrap();
        let err = repo
            .create_generator(&realm(), &GeneratorConfig::default())
            .unwrap_err();
        assert!(matches!(err, KernelError::GeneratorExists(r) if r == realm()));
    }

    #[test]
    fn marks_are_unique_per_agent_and_independent() {
        let repo = InMemoryGeneratorRepository::new();
        let g = repo
            .create_generator(&realm(), &GeneratorConfig::default())
            .unwrap();
        let now = Utc::now();
        let pause = Pause {
            generator_id: g.id,
            agent: agent(1),
            user: None,
            reason: "vacation".into(),
            timestamp: now,
        };
        let ready = Ready {
            generator_id: g.id,
            agent: agent(1),
            user: None,
            timestamp: now,
        };
        repo.add_pause(&pause).unwrap();
        repo.add_ready(&ready).unwrap();
        assert!(matches!(
            repo.add_pause(&pause),
            Err(KernelError::AlreadyPaused(_))
        ));
        assert!(matches!(
            repo.add_ready(&ready),
            Err(KernelError::AlreadyReady(_))
        ));
        assert!(repo.remove_pause(g.id, &agent(1)).unwrap());
        assert_eq!(repo.list_readies(g.id).unwrap().len(), 1);
    }

    #[test]
    fn delete_cascades_to_children() {
        let repo = InMemoryGeneratorRepository::new();
        let g = repo
            .create_generator(&realm(), &GeneratorConfig::default())
            .unwrap();
        repo.add_rule(g.id, &RecurrenceRule::new(crate::Frequency::Daily))
            .unwrap();
        repo.append_generation_time(g.id, Utc::now()).unwrap();
        assert!(repo.delete_generator(g.id).unwrap());
        assert!(repo.list_rules(g.id).unwrap().is_empty());
        assert!(repo.list_generation_times(g.id).unwrap().is_empty());
        assert!(!repo.delete_generator(g.id).unwrap());
    }

    #[test]
    fn generation_log_is_newest_first() {
        let repo = InMemoryGeneratorRepository::new();
        let g = repo
            .create_generator(&realm(), &GeneratorConfig::default())
            .unwrap();
        let t0 = Utc::now();
        repo.append_generation_time(g.id, t0).unwrap();
        repo.append_generation_time(g.id, t0 + Duration::hours(1))
            .unwrap();
        let last = repo.last_generation(g.id).unwrap().unwrap();
        assert_eq!(last.timestamp, t0 + Duration::hours(1));
    }

    #[test]
    fn lock_is_exclusive_and_release_applies_schedule() {
        let repo = InMemoryGeneratorRepository::new();
        let g = repo
            .create_generator(&realm(), &GeneratorConfig::default())
            .unwrap();
        assert!(repo.try_acquire_lock(g.id).unwrap());
        assert!(!repo.try_acquire_lock(g.id).unwrap());

        let eta = Utc::now();
        assert!(repo
            .release_lock(
                g.id,
                None,
                &ScheduleUpdate::Set {
                    handle: TaskHandle::new("next"),
                    eta,
                },
            )
            .unwrap());
        let g = repo.get_generator(g.id).unwrap().unwrap();
        assert!(!g.generating);
        assert_eq!(g.task_handle, Some(TaskHandle::new("next")));
        assert_eq!(g.generation_time, Some(eta));
    }

    #[test]
    fn release_keeps_a_schedule_written_under_the_lock() {
        let repo = InMemoryGeneratorRepository::new();
        let g = repo
            .create_generator(&realm(), &GeneratorConfig::default())
            .unwrap();
        let eta = Utc::now();
        assert!(repo.try_acquire_lock(g.id).unwrap());
        let concurrent = ScheduleUpdate::Set {
            handle: TaskHandle::new("concurrent"),
            eta,
        };
        assert!(repo.replace_schedule(g.id, None, &concurrent).unwrap());

        let applied = repo
            .release_lock(
                g.id,
                None,
                &ScheduleUpdate::Set {
                    handle: TaskHandle::new("mine"),
                    eta: eta + Duration::hours(1),
                },
            )
            .unwrap();
        assert!(!applied);
        let g = repo.get_generator(g.id).unwrap().unwrap();
        assert!(!g.generating);
        assert_eq!(g.task_handle, Some(TaskHandle::new("concurrent")));
        assert_eq!(g.generation_time, Some(eta));

        assert!(repo.try_acquire_lock(g.id).unwrap());
        assert!(repo.release_lock(g.id, None, &ScheduleUpdate::Keep).unwrap());
        assert!(!repo.get_generator(g.id).unwrap().unwrap().generating);
    }

    #[test]
    fn replace_schedule_checks_expected_handle() {
        let repo = InMemoryGeneratorRepository::new();
        let g = repo
            .create_generator(&realm(), &GeneratorConfig::default())
            .unwrap();
        let set = ScheduleUpdate::Set {
            handle: TaskHandle::new("a"),
            eta: Utc::now(),
        };
        assert!(repo.replace_schedule(g.id, None, &set).unwrap());
        assert!(!repo.replace_schedule(g.id, None, &set).unwrap());
        assert!(repo
            .replace_schedule(g.id, Some(&TaskHandle::new("a")), &ScheduleUpdate::Clear)
            .unwrap());
        assert_eq!(repo.get_generator(g.id).unwrap().unwrap().task_handle, None);
    }

    #[test]
    fn concurrent_lock_attempts_admit_exactly_one() {
        let repo = Arc::new(InMemoryGeneratorRepository::new());
        let g = repo
            .create_generator(&realm(), &GeneratorConfig::default())
            .unwrap();
        let winners = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let repo = repo.clone();
                let winners = winners.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    if repo.try_acquire_lock(g.id).unwrap() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }
}
