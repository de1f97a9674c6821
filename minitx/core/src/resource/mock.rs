//! Scriptable in-memory resource manager for tests.
//!
//! [`ScriptedResource`] behaves like a well-formed resource manager by
//! default: it votes to commit, keeps prepared branches until they are
//! committed or rolled back, and reports them from `recover`. Its prepared
//! branches live in the resource itself, so a test can drop a coordinator
//! ("crash") and hand the same resource to a new one.

use std::collections::VecDeque;
use std::thread;
use std::time::Duration;

use minitx_common::Xid;
use parking_lot::Mutex;

use super::{ResourceManager, Vote};
use crate::error::{ResourceError, ResourceResult};

/// One call the resource received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Start(Xid),
    End(Xid),
    Prepare(Xid),
    Commit { xid: Xid, one_phase: bool },
    Rollback(Xid),
    Recover,
    Forget(Xid),
}

impl Call {
    pub fn is_prepare(&self) -> bool {
        matches!(self, Call::Prepare(_))
    }

    pub fn is_commit(&self) -> bool {
        matches!(self, Call::Commit { .. })
    }

    pub fn is_rollback(&self) -> bool {
        matches!(self, Call::Rollback(_))
    }
}

/// What the resource does when an operation is called.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Behavior {
    #[default]
    Succeed,
    Fail(ResourceError),
    /// Sleeps, then succeeds.
    Hang(Duration),
    /// Panics, as if the process died during the call.
    Crash,
}

#[derive(Debug, Default)]
struct Script {
    once: VecDeque<Behavior>,
    always: Behavior,
}

impl Script {
    fn next(&mut self) -> Behavior {
        self.once.pop_front().unwrap_or_else(|| self.always.clone())
    }
}

#[derive(Debug, Default)]
struct State {
    calls: Vec<Call>,
    vote: Option<Vote>,
    last_resource: bool,
    prepare: Script,
    commit: Script,
    rollback: Script,
    recover: Script,
    in_doubt: Vec<Xid>,
    committed: Vec<Xid>,
    rolled_back: Vec<Xid>,
}

#[derive(Debug)]
pub struct ScriptedResource {
    name: String,
    state: Mutex<State>,
}

impl ScriptedResource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(State::default()),
        }
    }

    pub fn set_vote(&self, vote: Vote) {
        self.state.lock().vote = Some(vote);
    }

    pub fn set_last_resource(&self, last_resource: bool) {
        self.state.lock().last_resource = last_resource;
    }

    pub fn script_prepare(&self, behavior: Behavior) {
        self.state.lock().prepare.always = behavior;
    }

    pub fn script_commit(&self, behavior: Behavior) {
        self.state.lock().commit.always = behavior;
    }

    /// Applies `behavior` to the next commit only.
    pub fn script_commit_once(&self, behavior: Behavior) {
        self.state.lock().commit.once.push_back(behavior);
    }

    pub fn script_rollback(&self, behavior: Behavior) {
        self.state.lock().rollback.always = behavior;
    }

    pub fn script_recover(&self, behavior: Behavior) {
        self.state.lock().recover.always = behavior;
    }

    /// Resets every script to [`Behavior::Succeed`].
    pub fn clear_scripts(&self) {
        let mut state = self.state.lock();
        state.prepare = Script::default();
        state.commit = Script::default();
        state.rollback = Script::default();
        state.recover = Script::default();
    }

    /// Adds a prepared branch as if an earlier prepare had succeeded.
    pub fn inject_in_doubt(&self, xid: Xid) {
        self.state.lock().in_doubt.push(xid);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn in_doubt(&self) -> Vec<Xid> {
        self.state.lock().in_doubt.clone()
    }

    pub fn committed(&self) -> Vec<Xid> {
        self.state.lock().committed.clone()
    }

    pub fn rolled_back(&self) -> Vec<Xid> {
        self.state.lock().rolled_back.clone()
    }

    /// Records `call` and returns the scripted behavior. A hang is served
    /// here, without holding the lock.
    fn enter(&self, call: Call, script: fn(&mut State) -> &mut Script) -> ResourceResult<()> {
        let behavior = {
            let mut state = self.state.lock();
            state.calls.push(call);
            script(&mut state).next()
        };
        match behavior {
            Behavior::Succeed => Ok(()),
            Behavior::Fail(error) => Err(error),
            Behavior::Hang(duration) => {
                thread::sleep(duration);
                Ok(())
            }
            Behavior::Crash => panic!("simulated crash in {}", self.name),
        }
    }
}

impl ResourceManager for ScriptedResource {
    fn unique_name(&self) -> &str {
        &self.name
    }

    fn start(&self, xid: &Xid) -> ResourceResult<()> {
        self.state.lock().calls.push(Call::Start(xid.clone()));
        Ok(())
    }

    fn end(&self, xid: &Xid) -> ResourceResult<()> {
        self.state.lock().calls.push(Call::End(xid.clone()));
        Ok(())
    }

    fn prepare(&self, xid: &Xid) -> ResourceResult<Vote> {
        self.enter(Call::Prepare(xid.clone()), |state| &mut state.prepare)?;
        let mut state = self.state.lock();
        let vote = state.vote.unwrap_or(Vote::Commit);
        if vote == Vote::Commit && !state.in_doubt.contains(xid) {
            state.in_doubt.push(xid.clone());
        }
        Ok(vote)
    }

    fn commit(&self, xid: &Xid, one_phase: bool) -> ResourceResult<()> {
        let call = Call::Commit {
            xid: xid.clone(),
            one_phase,
        };
        let result = self.enter(call, |state| &mut state.commit);
        let mut state = self.state.lock();
        match result {
            Ok(()) => {
                let position = state.in_doubt.iter().position(|x| x == xid);
                match (position, one_phase) {
                    (Some(index), _) => {
                        state.in_doubt.remove(index);
                    }
                    (None, false) => return Err(ResourceError::BranchUnknown),
                    (None, true) => {}
                }
                state.committed.push(xid.clone());
                Ok(())
            }
            Err(ResourceError::Heuristic(outcome)) => {
                state.in_doubt.retain(|x| x != xid);
                Err(ResourceError::Heuristic(outcome))
            }
            Err(error) => Err(error),
        }
    }

    fn rollback(&self, xid: &Xid) -> ResourceResult<()> {
        self.enter(Call::Rollback(xid.clone()), |state| &mut state.rollback)?;
        let mut state = self.state.lock();
        state.in_doubt.retain(|x| x != xid);
        state.rolled_back.push(xid.clone());
        Ok(())
    }

    fn recover(&self) -> ResourceResult<Vec<Xid>> {
        self.enter(Call::Recover, |state| &mut state.recover)?;
        Ok(self.state.lock().in_doubt.clone())
    }

    fn forget(&self, xid: &Xid) -> ResourceResult<()> {
        let mut state = self.state.lock();
        state.calls.push(Call::Forget(xid.clone()));
        state.in_doubt.retain(|x| x != xid);
        Ok(())
    }

    fn is_last_resource(&self) -> bool {
        self.state.lock().last_resource
    }
}
