use std::{
    ops::{Deref, DerefMut},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU8, AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};

use crate::error::PipelineError;

use super::preprocess::ModelInput;

/// A loaded keypoint model. Returns the raw flat output buffer of
/// `(row, column, confidence)` triples.
pub trait PoseModel: Send + 'static {
    fn infer(&mut self, input: &ModelInput) -> anyhow::Result<Vec<f32>>;
}

/// Supplies a ready-to-run model. Called on the loader thread, so it may block
/// on disk or network.
pub trait ModelLoader: Send + Sync + 'static {
    fn load(&self) -> Result<Box<dyn PoseModel>, PipelineError>;

    fn describe(&self) -> String {
        "pose model".to_string()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ModelStatus {
    Unloaded = 0,
    Loading = 1,
    Ready = 2,
    Failed = 3,
}

impl ModelStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ModelStatus::Loading,
            2 => ModelStatus::Ready,
            3 => ModelStatus::Failed,
            _ => ModelStatus::Unloaded,
        }
    }
}

pub type LoadResult = Result<(), PipelineError>;

/// Sees every load outcome on the loader thread, before waiters are woken.
pub type LoadObserver = Arc<dyn Fn(&LoadResult) + Send + Sync>;

/// Completion of one `load()` request.
#[derive(Debug)]
pub struct LoadHandle {
    rx: Receiver<LoadResult>,
}

impl LoadHandle {
    /// Non-blocking poll. `None` while the load is still pending.
    pub fn try_result(&self) -> Option<LoadResult> {
        self.rx.try_recv().ok()
    }

    pub fn wait(&self, timeout: Duration) -> Option<LoadResult> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(PipelineError::ModelLoad(
                "model load was cancelled".into(),
            ))),
        }
    }
}

/// Owns the model. The frame processor only ever borrows it for one
/// inference call through [`ModelManager::get_handle_for_inference`].
pub struct ModelManager {
    loader: Arc<dyn ModelLoader>,
    slot: Mutex<Option<Box<dyn PoseModel>>>,
    status: AtomicU8,
    // Bumped by unload so a load finishing afterwards is discarded.
    generation: AtomicU64,
    last_error: Mutex<Option<String>>,
    waiters: Mutex<Vec<Sender<LoadResult>>>,
    observer: Mutex<Option<LoadObserver>>,
}

impl ModelManager {
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            loader,
            slot: Mutex::new(None),
            status: AtomicU8::new(ModelStatus::Unloaded as u8),
            generation: AtomicU64::new(0),
            last_error: Mutex::new(None),
            waiters: Mutex::new(Vec::new()),
            observer: Mutex::new(None),
        }
    }

    /// Registers the hook that applies load outcomes. It runs while the model
    /// slot is locked, so an outcome is never observed after a later unload.
    pub fn set_observer(&self, observer: LoadObserver) {
        if let Ok(mut slot) = self.observer.lock() {
            *slot = Some(observer);
        }
    }

    pub fn status(&self) -> ModelStatus {
        ModelStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn is_ready(&self) -> bool {
        self.status() == ModelStatus::Ready
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|err| err.clone())
    }

    /// Starts loading on a background thread. Returns immediately; the handle
    /// reports the outcome. Calling it while a load is pending joins that load.
    pub fn load(self: &Arc<Self>) -> LoadHandle {
        let (tx, rx) = bounded(1);
        if let Ok(mut waiters) = self.waiters.lock() {
            waiters.push(tx);
        }

        loop {
            let current = self.status.load(Ordering::Acquire);
            match ModelStatus::from_u8(current) {
                ModelStatus::Ready => {
                    self.notify_waiters(Ok(()));
                    break;
                }
                ModelStatus::Loading => break,
                ModelStatus::Unloaded | ModelStatus::Failed => {
                    if self
                        .status
                        .compare_exchange(
                            current,
                            ModelStatus::Loading as u8,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_err()
                    {
                        continue;
                    }
                    self.spawn_loader();
                    break;
                }
            }
        }

        LoadHandle { rx }
    }

    /// Loads on the calling thread.
    pub fn load_blocking(&self) -> LoadResult {
        if self.is_ready() {
            return Ok(());
        }
        self.status
            .store(ModelStatus::Loading as u8, Ordering::Release);
        let generation = self.generation.load(Ordering::Acquire);
        let result = self.loader.load();
        self.finish_load(generation, result).unwrap_or_else(|| {
            Err(PipelineError::ModelLoad("model was unloaded while loading".into()))
        })
    }

    fn spawn_loader(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let generation = self.generation.load(Ordering::Acquire);
        let spawned = thread::Builder::new()
            .name("pose-model-loader".into())
            .spawn(move || {
                log::info!("loading {}", manager.loader.describe());
                let result = manager.loader.load();
                if let Some(outcome) = manager.finish_load(generation, result) {
                    manager.notify_waiters(outcome);
                }
            });

        if let Err(err) = spawned {
            let failed = Err(PipelineError::ModelLoad(format!(
                "failed to spawn model loader thread: {err}"
            )));
            if let Some(outcome) = self.finish_load(generation, failed) {
                self.notify_waiters(outcome);
            }
        }
    }

    /// `None` when an unload happened since the load started; the result is
    /// dropped and waiters belong to whichever load comes next.
    fn finish_load(
        &self,
        generation: u64,
        result: Result<Box<dyn PoseModel>, PipelineError>,
    ) -> Option<LoadResult> {
        // Generation is compared under the slot lock; unload bumps it under
        // the same lock.
        let mut slot = match self.slot.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        if self.generation.load(Ordering::Acquire) != generation {
            log::info!("discarding model load that finished after unload");
            return None;
        }

        let outcome = match result {
            Ok(model) => {
                *slot = Some(model);
                if let Ok(mut last) = self.last_error.lock() {
                    *last = None;
                }
                self.status.store(ModelStatus::Ready as u8, Ordering::Release);
                log::info!("{} ready", self.loader.describe());
                Ok(())
            }
            Err(err) => self.fail(err),
        };
        let observer = self.observer.lock().ok().and_then(|o| o.clone());
        if let Some(observer) = observer {
            observer(&outcome);
        }
        drop(slot);
        Some(outcome)
    }

    fn fail(&self, err: PipelineError) -> LoadResult {
        log::error!("{}: {err}", self.loader.describe());
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(err.to_string());
        }
        self.status.store(ModelStatus::Failed as u8, Ordering::Release);
        Err(err)
    }

    fn notify_waiters(&self, outcome: LoadResult) {
        let waiters = match self.waiters.lock() {
            Ok(mut waiters) => std::mem::take(&mut *waiters),
            Err(_) => return,
        };
        for waiter in waiters {
            let _ = waiter.try_send(outcome.clone());
        }
    }

    /// Borrows the model for one inference call. Never blocks: returns `None`
    /// when the model is not ready or is being torn down.
    pub fn get_handle_for_inference(&self) -> Option<ModelHandle<'_>> {
        if !self.is_ready() {
            return None;
        }
        let guard = self.slot.try_lock().ok()?;
        if guard.is_none() {
            return None;
        }
        Some(ModelHandle { guard })
    }

    /// Releases the model. Waits for an in-flight inference to return its
    /// borrow. Idempotent.
    pub fn unload(&self) {
        let released = {
            let mut slot = match self.slot.lock() {
                Ok(slot) => slot,
                Err(poisoned) => poisoned.into_inner(),
            };
            self.generation.fetch_add(1, Ordering::AcqRel);
            self.status
                .store(ModelStatus::Unloaded as u8, Ordering::Release);
            slot.take()
        };
        if released.is_some() {
            log::info!("{} released", self.loader.describe());
        }
        drop(released);
        self.notify_waiters(Err(PipelineError::ModelLoad(
            "model was unloaded while loading".into(),
        )));
    }
}

/// Scoped borrow of the loaded model.
pub struct ModelHandle<'a> {
    guard: MutexGuard<'a, Option<Box<dyn PoseModel>>>,
}

impl Deref for ModelHandle<'_> {
    type Target = dyn PoseModel;

    fn deref(&self) -> &Self::Target {
        match self.guard.as_deref() {
            Some(model) => model,
            None => unreachable!("handle is only created over a loaded model"),
        }
    }
}

impl DerefMut for ModelHandle<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self.guard.as_deref_mut() {
            Some(model) => model,
            None => unreachable!("handle is only created over a loaded model"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct EchoModel;

    impl PoseModel for EchoModel {
        fn infer(&mut self, _input: &ModelInput) -> anyhow::Result<Vec<f32>> {
            Ok(vec![0.5; 51])
        }
    }

    struct CountingLoader {
        calls: AtomicUsize,
        fail: bool,
    }

    impl ModelLoader for CountingLoader {
        fn load(&self) -> Result<Box<dyn PoseModel>, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(PipelineError::ModelLoad("bad format".into()))
            } else {
                Ok(Box::new(EchoModel))
            }
        }
    }

    fn manager(fail: bool) -> (Arc<ModelManager>, Arc<CountingLoader>) {
        let loader = Arc::new(CountingLoader {
            calls: AtomicUsize::new(0),
            fail,
        });
        (Arc::new(ModelManager::new(loader.clone())), loader)
    }

    #[test]
    fn async_load_reaches_ready_and_lends_handle() {
        let (manager, loader) = manager(false);
        assert!(manager.get_handle_for_inference().is_none());

        let handle = manager.load();
        assert_eq!(handle.wait(Duration::from_secs(5)), Some(Ok(())));
        assert_eq!(manager.status(), ModelStatus::Ready);

        let mut model = manager.get_handle_for_inference().expect("model ready");
        let input = ModelInput::empty(1);
        assert_eq!(model.infer(&input).unwrap().len(), 51);
        drop(model);

        // Already ready: no second load.
        let again = manager.load();
        assert_eq!(again.wait(Duration::from_secs(1)), Some(Ok(())));
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_load_records_reason() {
        let (manager, _) = manager(true);
        let handle = manager.load();
        assert_eq!(
            handle.wait(Duration::from_secs(5)),
            Some(Err(PipelineError::ModelLoad("bad format".into())))
        );
        assert_eq!(manager.status(), ModelStatus::Failed);
        assert_eq!(
            manager.last_error().as_deref(),
            Some("model load failed: bad format")
        );
        assert!(manager.get_handle_for_inference().is_none());
    }

    #[test]
    fn unload_is_idempotent() {
        let (manager, _) = manager(false);
        manager.unload();
        assert_eq!(manager.status(), ModelStatus::Unloaded);

        manager.load_blocking().unwrap();
        assert!(manager.get_handle_for_inference().is_some());
        manager.unload();
        manager.unload();
        assert_eq!(manager.status(), ModelStatus::Unloaded);
        assert!(manager.get_handle_for_inference().is_none());
    }

    #[test]
    fn observer_sees_outcome_before_waiters() {
        let (manager, _) = manager(false);
        let (seen_tx, seen_rx) = bounded(4);
        manager.set_observer(Arc::new(move |outcome: &LoadResult| {
            let _ = seen_tx.try_send(outcome.clone());
        }));

        let handle = manager.load();
        assert_eq!(handle.wait(Duration::from_secs(5)), Some(Ok(())));
        assert_eq!(seen_rx.try_recv(), Ok(Ok(())));

        // Unload wakes waiters but is not a load outcome.
        manager.unload();
        assert!(seen_rx.try_recv().is_err());
    }

    #[test]
    fn handle_is_not_lent_twice() {
        let (manager, _) = manager(false);
        manager.load_blocking().unwrap();
        let first = manager.get_handle_for_inference();
        assert!(first.is_some());
        assert!(manager.get_handle_for_inference().is_none());
    }
}
