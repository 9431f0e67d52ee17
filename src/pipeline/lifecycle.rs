use std::{
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU8, Ordering},
    },
    time::{Duration, Instant},
};

use crate::{error::PipelineError, types::PipelineState};

use super::{
    bridge::PoseBridge,
    model::{LoadHandle, LoadResult, ModelManager, ModelStatus},
};

/// Pipeline state shared with the frame processor.
///
/// Reads are lock-free so the admission check never waits on the controller.
/// Transitions and publication share one short critical section: once `set`
/// returns, no publication that saw the old state can still be in progress.
#[derive(Debug)]
pub struct StateCell {
    state: AtomicU8,
    transition: Mutex<()>,
}

impl StateCell {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(PipelineState::Idle as u8),
            transition: Mutex::new(()),
        }
    }

    pub fn get(&self) -> PipelineState {
        PipelineState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.get() == PipelineState::Active
    }

    pub(crate) fn set(&self, next: PipelineState) {
        let _transition = self.lock_transition();
        let prev = PipelineState::from_u8(self.state.swap(next as u8, Ordering::AcqRel));
        if prev != next {
            log::info!("pipeline state {} -> {}", prev.label(), next.label());
        }
    }

    /// Runs `publish` only while `Active`. Never held across inference.
    pub fn publish_if_active<F: FnOnce()>(&self, publish: F) -> bool {
        let _transition = self.lock_transition();
        if !self.is_active() {
            return false;
        }
        publish();
        true
    }

    fn lock_transition(&self) -> MutexGuard<'_, ()> {
        match self.transition.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppState {
    Foreground,
    Background,
}

/// A running camera stream owned by the controller while the screen is
/// mounted. `stop` must release the device before returning.
pub trait FrameSource: Send {
    fn stop(self: Box<Self>);
}

#[derive(Clone, Copy, Debug, Default)]
struct Conditions {
    mounted: bool,
    focused: bool,
    foreground: bool,
    permission: bool,
}

impl Conditions {
    fn allow_active(&self) -> bool {
        self.mounted && self.focused && self.foreground && self.permission
    }
}

#[derive(Debug, Default)]
struct Shared {
    conditions: Conditions,
    last_error: Option<PipelineError>,
    // Load failure not yet handed out by `pump`.
    unreported: Option<PipelineError>,
}

/// Transition rules, shared between the UI thread and the model loader
/// thread that applies load outcomes.
struct Transitions {
    state: Arc<StateCell>,
    shared: Mutex<Shared>,
}

impl Transitions {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        match self.shared.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn apply_load(&self, outcome: &LoadResult) {
        let mut shared = self.lock();
        if self.state.get() != PipelineState::ModelLoading {
            return;
        }
        match outcome {
            Ok(()) => {
                self.state.set(PipelineState::Ready);
                self.evaluate(&shared);
            }
            Err(err) => {
                self.state.set(PipelineState::Error);
                shared.last_error = Some(err.clone());
                shared.unreported = Some(err.clone());
            }
        }
    }

    fn update<F: FnOnce(&mut Conditions)>(&self, change: F) {
        let mut shared = self.lock();
        change(&mut shared.conditions);
        self.evaluate(&shared);
    }

    fn evaluate(&self, shared: &Shared) {
        let allow = shared.conditions.allow_active();
        match self.state.get() {
            PipelineState::Ready if allow => self.state.set(PipelineState::Active),
            PipelineState::Active if !allow => self.state.set(PipelineState::Ready),
            _ => {}
        }
    }

    fn blocker(&self) -> Option<PipelineError> {
        let shared = self.lock();
        match self.state.get() {
            PipelineState::Error => shared.last_error.clone(),
            PipelineState::Ready if !shared.conditions.permission => {
                Some(PipelineError::PermissionDenied)
            }
            _ => None,
        }
    }
}

/// Drives `PipelineState` from screen and app events.
///
/// Lives on the UI thread. Model loads run in the background and their
/// outcome is applied by the loader thread as soon as it finishes.
pub struct LifecycleController {
    state: Arc<StateCell>,
    model: Arc<ModelManager>,
    bridge: Arc<PoseBridge>,
    transitions: Arc<Transitions>,
    pending_load: Option<LoadHandle>,
    camera: Option<Box<dyn FrameSource>>,
}

impl LifecycleController {
    pub fn new(state: Arc<StateCell>, model: Arc<ModelManager>, bridge: Arc<PoseBridge>) -> Self {
        let transitions = Arc::new(Transitions {
            state: Arc::clone(&state),
            shared: Mutex::new(Shared {
                conditions: Conditions {
                    foreground: true,
                    ..Conditions::default()
                },
                ..Shared::default()
            }),
        });
        let observer = Arc::clone(&transitions);
        model.set_observer(Arc::new(move |outcome: &LoadResult| {
            observer.apply_load(outcome)
        }));

        Self {
            state,
            model,
            bridge,
            transitions,
            pending_load: None,
            camera: None,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state.get()
    }

    pub fn last_error(&self) -> Option<PipelineError> {
        self.transitions.lock().last_error.clone()
    }

    /// Screen mounted: begin loading the model unless it is already ready.
    pub fn mount(&mut self) {
        let needs_load = {
            let mut shared = self.transitions.lock();
            if shared.conditions.mounted {
                return;
            }
            shared.conditions.mounted = true;
            match self.model.status() {
                ModelStatus::Ready => {
                    self.state.set(PipelineState::Ready);
                    self.transitions.evaluate(&shared);
                    false
                }
                _ => true,
            }
        };
        if needs_load {
            self.begin_load();
        }
    }

    /// Screen unmounted: back to `Idle`, releasing the camera and the model.
    pub fn unmount(&mut self) {
        {
            let mut shared = self.transitions.lock();
            // Closes admission and publication before anything is torn down.
            self.state.set(PipelineState::Idle);
            shared.conditions.mounted = false;
            shared.conditions.focused = false;
            shared.last_error = None;
            shared.unreported = None;
        }
        self.pending_load = None;
        self.bridge.write(Vec::new());

        if let Some(camera) = self.camera.take() {
            camera.stop();
            log::info!("camera released");
        }
        self.model.unload();
    }

    /// Hosting screen wants the pipeline running. Mounts when needed and marks
    /// the screen focused. Reports what currently blocks activation, if any.
    pub fn start(&mut self) -> Result<(), PipelineError> {
        self.mount();
        self.transitions.update(|c| c.focused = true);
        match self.blocker() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Hosting screen no longer wants frames processed.
    pub fn stop(&mut self) {
        self.transitions.update(|c| c.focused = false);
    }

    pub fn on_focus_changed(&mut self, focused: bool) {
        self.transitions.update(|c| c.focused = focused);
    }

    pub fn on_app_state_changed(&mut self, app_state: AppState) {
        self.transitions
            .update(|c| c.foreground = app_state == AppState::Foreground);
    }

    pub fn on_permission_changed(&mut self, granted: bool) {
        self.transitions.update(|c| c.permission = granted);
    }

    pub fn attach_camera(&mut self, camera: Box<dyn FrameSource>) {
        if let Some(previous) = self.camera.replace(camera) {
            previous.stop();
        }
    }

    /// Explicit retry after a failed load. No-op outside `Error`.
    pub fn retry_load(&mut self) {
        if self.state.get() == PipelineState::Error {
            self.begin_load();
        }
    }

    /// Returns a load failure the first time it is observed.
    pub fn pump(&mut self) -> Option<PipelineError> {
        if self
            .pending_load
            .as_ref()
            .is_some_and(|pending| pending.try_result().is_some())
        {
            self.pending_load = None;
        }
        self.transitions.lock().unreported.take()
    }

    /// Blocks up to `timeout` for a pending load. Returns true when the model
    /// is ready afterwards.
    pub fn wait_for_model(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        if let Some(pending) = self.pending_load.take() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if pending.wait(remaining).is_none() {
                self.pending_load = Some(pending);
            }
        }
        self.model.is_ready()
    }

    /// What currently prevents `Ready -> Active`, if anything.
    pub fn blocker(&self) -> Option<PipelineError> {
        self.transitions.blocker()
    }

    fn begin_load(&mut self) {
        {
            let mut shared = self.transitions.lock();
            shared.last_error = None;
            shared.unreported = None;
            self.state.set(PipelineState::ModelLoading);
        }
        self.pending_load = Some(self.model.load());
    }
}

impl Drop for LifecycleController {
    fn drop(&mut self) {
        let mounted = self.transitions.lock().conditions.mounted;
        if mounted || self.camera.is_some() {
            self.unmount();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{
        model::{ModelLoader, PoseModel},
        preprocess::ModelInput,
    };
    use crossbeam_channel::{Receiver, Sender, unbounded};
    use std::sync::atomic::AtomicBool;

    struct NullModel;

    impl PoseModel for NullModel {
        fn infer(&mut self, _input: &ModelInput) -> anyhow::Result<Vec<f32>> {
            Ok(Vec::new())
        }
    }

    // Each load waits for one token so tests can observe `ModelLoading`.
    struct GatedLoader {
        fail: bool,
        release: Receiver<()>,
    }

    impl ModelLoader for GatedLoader {
        fn load(&self) -> Result<Box<dyn PoseModel>, PipelineError> {
            let _ = self.release.recv_timeout(Duration::from_secs(5));
            if self.fail {
                Err(PipelineError::ModelLoad("unreachable host".into()))
            } else {
                Ok(Box::new(NullModel))
            }
        }
    }

    struct FlagCamera(Arc<AtomicBool>);

    impl FrameSource for FlagCamera {
        fn stop(self: Box<Self>) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    fn controller(fail: bool) -> (LifecycleController, Sender<()>) {
        let (release_tx, release_rx) = unbounded();
        let loader = GatedLoader {
            fail,
            release: release_rx,
        };
        let model = Arc::new(ModelManager::new(Arc::new(loader)));
        let ctl = LifecycleController::new(
            Arc::new(StateCell::new()),
            model,
            Arc::new(PoseBridge::new()),
        );
        (ctl, release_tx)
    }

    fn settle(ctl: &LifecycleController, expected: PipelineState) -> PipelineState {
        let deadline = Instant::now() + Duration::from_secs(5);
        while ctl.state() != expected && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        ctl.state()
    }

    #[test]
    fn activates_only_when_all_conditions_hold() {
        let (mut ctl, release) = controller(false);
        ctl.mount();
        assert_eq!(ctl.state(), PipelineState::ModelLoading);
        release.send(()).unwrap();
        assert!(ctl.wait_for_model(Duration::from_secs(5)));
        assert_eq!(ctl.state(), PipelineState::Ready);

        ctl.on_focus_changed(true);
        assert_eq!(ctl.state(), PipelineState::Ready);
        ctl.on_permission_changed(true);
        assert_eq!(ctl.state(), PipelineState::Active);

        ctl.on_app_state_changed(AppState::Background);
        assert_eq!(ctl.state(), PipelineState::Ready);
        ctl.on_app_state_changed(AppState::Foreground);
        assert_eq!(ctl.state(), PipelineState::Active);

        ctl.on_permission_changed(false);
        assert_eq!(ctl.state(), PipelineState::Ready);
        assert_eq!(ctl.blocker(), Some(PipelineError::PermissionDenied));
    }

    #[test]
    fn finished_load_applies_without_further_events() {
        let (mut ctl, release) = controller(false);
        ctl.on_permission_changed(true);
        assert_eq!(ctl.start(), Ok(()));
        assert_eq!(ctl.state(), PipelineState::ModelLoading);

        release.send(()).unwrap();
        assert_eq!(settle(&ctl, PipelineState::Active), PipelineState::Active);
    }

    #[test]
    fn failed_load_waits_for_explicit_retry() {
        let (mut ctl, release) = controller(true);
        ctl.mount();
        release.send(()).unwrap();
        assert!(!ctl.wait_for_model(Duration::from_secs(5)));
        assert_eq!(ctl.state(), PipelineState::Error);
        let failure = PipelineError::ModelLoad("unreachable host".into());
        assert_eq!(ctl.last_error(), Some(failure.clone()));
        assert_eq!(ctl.pump(), Some(failure.clone()));
        assert_eq!(ctl.pump(), None);

        ctl.on_focus_changed(true);
        ctl.on_permission_changed(true);
        assert_eq!(ctl.state(), PipelineState::Error);
        assert_eq!(ctl.start(), Err(failure));

        ctl.retry_load();
        assert_eq!(ctl.state(), PipelineState::ModelLoading);
        release.send(()).unwrap();
        ctl.wait_for_model(Duration::from_secs(5));
        assert_eq!(ctl.state(), PipelineState::Error);
    }

    #[test]
    fn unmount_returns_to_idle_and_releases_resources() {
        let (mut ctl, release) = controller(false);
        let released = Arc::new(AtomicBool::new(false));
        ctl.attach_camera(Box::new(FlagCamera(released.clone())));
        ctl.on_permission_changed(true);
        ctl.start().unwrap_or(());
        release.send(()).unwrap();
        ctl.wait_for_model(Duration::from_secs(5));
        assert_eq!(ctl.state(), PipelineState::Active);

        ctl.unmount();
        assert_eq!(ctl.state(), PipelineState::Idle);
        assert!(released.load(Ordering::SeqCst));
        assert!(ctl.model.get_handle_for_inference().is_none());

        // Re-entrant across mount cycles.
        ctl.start().unwrap_or(());
        assert_eq!(ctl.state(), PipelineState::ModelLoading);
        release.send(()).unwrap();
        assert!(ctl.wait_for_model(Duration::from_secs(5)));
        assert_eq!(ctl.state(), PipelineState::Active);
    }

    #[test]
    fn publication_is_refused_once_state_leaves_active() {
        let state = StateCell::new();
        state.set(PipelineState::Active);
        assert!(state.publish_if_active(|| {}));
        state.set(PipelineState::Ready);
        let mut ran = false;
        assert!(!state.publish_if_active(|| ran = true));
        assert!(!ran);
    }
}
