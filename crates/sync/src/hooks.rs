#![forbid(unsafe_code)]

use crate::error::SyncError;
use pl_core::model::EntityChange;

/// Lifecycle callbacks a unit of work invokes directly.
///
/// Entity callbacks run at the flush point: the statement has executed and the
/// row has its id, but nothing is durable yet. An `Err` from any of them aborts
/// the unit of work. `on_after_commit` runs once the relational commit is
/// final, so its failures are reported rather than undoing anything.
pub trait UnitOfWorkHooks {
    fn on_entity_created(&mut self, change: &EntityChange) -> Result<(), SyncError> {
        let _ = change;
        Ok(())
    }

    fn on_entity_updated(&mut self, change: &EntityChange) -> Result<(), SyncError> {
        let _ = change;
        Ok(())
    }

    fn on_entity_deleted(&mut self, change: &EntityChange) -> Result<(), SyncError> {
        let _ = change;
        Ok(())
    }

    fn on_before_commit(&mut self) -> Result<(), SyncError> {
        Ok(())
    }

    fn on_after_commit(&mut self) -> Vec<SyncError> {
        Vec::new()
    }

    fn on_rollback(&mut self) {}
}

/// No side effects; for units of work that only touch the relational store.
pub struct NoHooks;

impl UnitOfWorkHooks for NoHooks {}

/// Fans every callback out to its members in registration order.
#[derive(Default)]
pub struct HookChain<'a> {
    hooks: Vec<&'a mut dyn UnitOfWorkHooks>,
}

impl<'a> HookChain<'a> {
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    pub fn with(mut self, hook: &'a mut dyn UnitOfWorkHooks) -> Self {
        self.hooks.push(hook);
        self
    }
}

impl UnitOfWorkHooks for HookChain<'_> {
    fn on_entity_created(&mut self, change: &EntityChange) -> Result<(), SyncError> {
        for hook in &mut self.hooks {
            hook.on_entity_created(change)?;
        }
        Ok(())
    }

    fn on_entity_updated(&mut self, change: &EntityChange) -> Result<(), SyncError> {
        for hook in &mut self.hooks {
            hook.on_entity_updated(change)?;
        }
        Ok(())
    }

    fn on_entity_deleted(&mut self, change: &EntityChange) -> Result<(), SyncError> {
        for hook in &mut self.hooks {
            hook.on_entity_deleted(change)?;
        }
        Ok(())
    }

    fn on_before_commit(&mut self) -> Result<(), SyncError> {
        for hook in &mut self.hooks {
            hook.on_before_commit()?;
        }
        Ok(())
    }

    fn on_after_commit(&mut self) -> Vec<SyncError> {
        self.hooks
            .iter_mut()
            .flat_map(|hook| hook.on_after_commit())
            .collect()
    }

    fn on_rollback(&mut self) {
        for hook in &mut self.hooks {
            hook.on_rollback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TrackingError;
    use pl_core::ids::EntityType;

    #[derive(Default)]
    struct Recorder {
        calls: Vec<String>,
        fail_created: bool,
    }

    impl UnitOfWorkHooks for Recorder {
        fn on_entity_created(&mut self, change: &EntityChange) -> Result<(), SyncError> {
            self.calls.push(format!("created:{}", change.id));
            if self.fail_created {
                return Err(TrackingError::Detached.into());
            }
            Ok(())
        }

        fn on_rollback(&mut self) {
            self.calls.push("rollback".to_string());
        }
    }

    #[test]
    fn chain_stops_at_first_flush_failure() {
        let mut first = Recorder {
            fail_created: true,
            ..Recorder::default()
        };
        let mut second = Recorder::default();
        let change = EntityChange::row(EntityType::try_new("plan").expect("type"), 7);

        {
            let mut chain = HookChain::new().with(&mut first).with(&mut second);
            assert!(chain.on_entity_created(&change).is_err());
            chain.on_rollback();
        }

        assert_eq!(first.calls, vec!["created:7", "rollback"]);
        assert_eq!(second.calls, vec!["rollback"]);
    }
}
