//! End-to-end battle preparation over real thread pools.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::thread;

use bevy_async_promise::pipeline::{
    Asset, AssetKey, AssetKind, AssetSource, BattlePreparer, CompiledAsset, PreparedAsset,
    ShaderCompiler, StateService, UserId, UserState,
};
use bevy_async_promise::{
    CancelToken, Duration, Error, Executor, ExecutorExt, Future, FutureState, PoolConfig,
    ThreadExecutor, ThreadPoolExecutor,
};

struct RemoteStates {
    executor: ThreadExecutor,
}

impl StateService for RemoteStates {
    fn get_user_state(&self, user: &UserId) -> Future<UserState> {
        let user = user.clone();
        self.executor.submit(move |_| {
            thread::sleep(std::time::Duration::from_millis(5));
            let loadout = if user.as_str() == "player" {
                vec![
                    AssetKey::new("knight.mesh", AssetKind::Mesh),
                    AssetKey::new("glow.wgsl", AssetKind::Shader),
                ]
            } else {
                vec![
                    AssetKey::new("dragon.png", AssetKind::Texture),
                    AssetKey::new("glow.wgsl", AssetKind::Shader),
                ]
            };
            Ok(UserState { user, loadout })
        })
    }
}

#[derive(Default)]
struct SlowSource {
    started: AtomicUsize,
    cancelled: AtomicUsize,
    block_until_cancelled: bool,
}

impl AssetSource for SlowSource {
    fn fetch(&self, key: &AssetKey, cancel: &CancelToken) -> Result<Asset, Error> {
        self.started.fetch_add(1, Ordering::SeqCst);
        if self.block_until_cancelled {
            while !cancel.is_cancelled() {
                thread::sleep(std::time::Duration::from_millis(1));
            }
            self.cancelled.fetch_add(1, Ordering::SeqCst);
            return Err(Error::Cancelled);
        }
        thread::sleep(std::time::Duration::from_millis(2));
        Ok(Asset {
            key: key.clone(),
            bytes: Arc::from(key.name.as_bytes()),
        })
    }
}

struct Compiler {
    fail: bool,
}

impl ShaderCompiler for Compiler {
    fn compile(&self, asset: Asset, _cancel: &CancelToken) -> Result<CompiledAsset, Error> {
        if self.fail {
            return Err(Error::msg(format!("{}: syntax error", asset.key)));
        }
        Ok(CompiledAsset {
            key: asset.key,
            bytes: Arc::from(&b"spirv"[..]),
        })
    }
}

fn pool(name: &str, workers: usize) -> Arc<dyn Executor> {
    let config = PoolConfig::default()
        .with_name(name)
        .with_workers(workers)
        .with_queue_capacity(8);
    Arc::new(ThreadPoolExecutor::new(config).unwrap())
}

fn preparer(source: Arc<SlowSource>, fail_compile: bool) -> BattlePreparer {
    BattlePreparer::new(
        Arc::new(RemoteStates {
            executor: ThreadExecutor::new("state-service"),
        }),
        source,
        Arc::new(Compiler { fail: fail_compile }),
        pool("downloads", 4),
        pool("compiles", 1),
    )
}

#[test]
fn test_battle_prepares_every_asset() {
    let source = Arc::new(SlowSource::default());
    let battle = preparer(source.clone(), false)
        .prepare_battle(&"player".into(), &"enemy".into())
        .get(Some(Duration::from_secs(10)))
        .unwrap();

    let keys: Vec<_> = battle.iter().map(|a| a.key().name.as_str()).collect();
    assert_eq!(vec!["knight.mesh", "glow.wgsl", "dragon.png"], keys);
    assert!(matches!(battle[0], PreparedAsset::Raw(_)));
    assert!(matches!(battle[1], PreparedAsset::Compiled(_)));
    assert!(matches!(battle[2], PreparedAsset::Raw(_)));
    assert_eq!(3, source.started.load(Ordering::SeqCst));
}

#[test]
fn test_compile_failure_rejects_whole_battle() {
    let source = Arc::new(SlowSource::default());
    let outcome = preparer(source, true)
        .prepare_battle(&"player".into(), &"enemy".into())
        .get(Some(Duration::from_secs(10)));

    match outcome {
        Err(err) => assert_eq!("glow.wgsl: syntax error", err.to_string()),
        Ok(assets) => panic!("expected a compile failure, got {} assets", assets.len()),
    }
}

/// Run `f` on another thread and fail instead of hanging if it blocks.
fn within<R: Send + 'static>(what: &'static str, f: impl FnOnce() -> R + Send + 'static) -> R {
    let (done, finished) = mpsc::channel();
    thread::spawn(move || {
        _ = done.send(f());
    });
    finished
        .recv_timeout(std::time::Duration::from_secs(10))
        .unwrap_or_else(|_| panic!("{what} did not finish"))
}

fn wait_for(counter: &AtomicUsize, target: usize, what: &str) {
    let deadline = web_time::Instant::now() + Duration::from_secs(10);
    while counter.load(Ordering::SeqCst) < target {
        assert!(web_time::Instant::now() < deadline, "{what}");
        thread::sleep(std::time::Duration::from_millis(1));
    }
}

fn blocking_source() -> Arc<SlowSource> {
    Arc::new(SlowSource {
        block_until_cancelled: true,
        ..SlowSource::default()
    })
}

#[test]
fn test_cancel_reaches_downloads() {
    let source = blocking_source();
    let battle = preparer(source.clone(), false).prepare_battle(&"player".into(), &"enemy".into());
    wait_for(&source.started, 3, "downloads never started");

    let cancelled = battle.clone();
    assert!(within("cancel", move || cancelled.cancel()));
    assert_eq!(FutureState::Cancelled, battle.state());
    wait_for(&source.cancelled, 3, "downloads never saw the cancellation");
}

#[test]
fn test_cancel_after_preparer_is_dropped() {
    let source = blocking_source();
    let preparer = preparer(source.clone(), false);
    let battle = preparer.prepare_battle(&"player".into(), &"enemy".into());
    wait_for(&source.started, 3, "downloads never started");
    // The pipeline's continuations now hold the last handles to both pools.
    drop(preparer);

    let cancelled = battle.clone();
    assert!(within("cancel", move || cancelled.cancel()));
    wait_for(&source.cancelled, 3, "downloads never saw the cancellation");
}

#[test]
fn test_get_times_out_and_cancels() {
    let battle = preparer(blocking_source(), false).prepare_battle(&"player".into(), &"enemy".into());
    let waited = battle.clone();
    let outcome = within("get", move || waited.get(Some(Duration::from_millis(50))));
    assert!(outcome.is_err_and(|err| err.is_timeout()));
    assert_eq!(FutureState::Cancelled, battle.state());
}
