//! Battle demo - prepares a battle off the frame thread and polls the outcome
//! once per tick from a `bevy_ecs` schedule.
//!
//! Run with `RUST_LOG=debug` to see each pipeline stage.

use std::sync::Arc;
use std::task::Poll;
use std::thread;

use bevy_async_promise::pipeline::{
    Asset, AssetKey, AssetKind, AssetSource, BattlePreparer, CompiledAsset, PreparedAsset,
    ShaderCompiler, StateService, UserId, UserState,
};
use bevy_async_promise::{
    CancelToken, ComputePoolExecutor, Duration, Error, ExecutorExt, Future, FuturePoller,
    PoolConfig, ThreadExecutor, ThreadPoolExecutor,
};
use bevy_ecs::prelude::*;
use tracing_subscriber::EnvFilter;

struct Backend;

impl StateService for Backend {
    fn get_user_state(&self, user: &UserId) -> Future<UserState> {
        let user = user.clone();
        ThreadExecutor::new("backend").submit(move |_| {
            thread::sleep(std::time::Duration::from_millis(8));
            let loadout = vec![
                AssetKey::new(format!("{user}/avatar.png"), AssetKind::Texture),
                AssetKey::new(format!("{user}/body.mesh"), AssetKind::Mesh),
                AssetKey::new("arena/water.wgsl", AssetKind::Shader),
            ];
            Ok(UserState { user, loadout })
        })
    }
}

struct Cdn;

impl AssetSource for Cdn {
    fn fetch(&self, key: &AssetKey, cancel: &CancelToken) -> Result<Asset, Error> {
        for _ in 0..10 {
            cancel.check()?;
            thread::sleep(std::time::Duration::from_millis(3));
        }
        Ok(Asset {
            key: key.clone(),
            bytes: Arc::from(key.name.as_bytes()),
        })
    }
}

struct Naga;

impl ShaderCompiler for Naga {
    fn compile(&self, asset: Asset, cancel: &CancelToken) -> Result<CompiledAsset, Error> {
        cancel.check()?;
        thread::sleep(std::time::Duration::from_millis(20));
        Ok(CompiledAsset {
            key: asset.key,
            bytes: Arc::from(&b"\x03\x02\x23\x07"[..]),
        })
    }
}

#[derive(Resource)]
struct Preparer(BattlePreparer);

#[derive(Resource, Default)]
struct Outcome(Option<Result<Vec<PreparedAsset>, Error>>);

fn start_battle(
    mut poller: Local<'_, FuturePoller<Vec<PreparedAsset>>>,
    preparer: Res<'_, Preparer>,
    mut outcome: ResMut<'_, Outcome>,
    mut ticks: Local<'_, u32>,
) {
    *ticks += 1;
    if poller.is_idle() && outcome.0.is_none() {
        tracing::info!("requesting battle");
        poller.start(preparer.0.prepare_battle(&"alice".into(), &"bob".into()));
    }
    if let Poll::Ready(result) = poller.poll() {
        tracing::info!(ticks = *ticks, "battle ready");
        outcome.0 = Some(result);
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let downloads = ThreadPoolExecutor::new(
        PoolConfig::default()
            .with_name("downloads")
            .with_workers(8)
            .with_queue_capacity(32),
    )?;
    let preparer = BattlePreparer::new(
        Arc::new(Backend),
        Arc::new(Cdn),
        Arc::new(Naga),
        Arc::new(downloads),
        Arc::new(ComputePoolExecutor),
    );

    let mut world = World::new();
    world.insert_resource(Preparer(preparer));
    world.init_resource::<Outcome>();
    let mut schedule = Schedule::default();
    schedule.add_systems(start_battle);

    let frame = Duration::from_millis(16);
    while world.resource::<Outcome>().0.is_none() {
        schedule.run(&mut world);
        thread::sleep(frame);
    }

    match world.resource_mut::<Outcome>().0.take() {
        Some(Ok(assets)) => {
            for asset in &assets {
                let kind = match asset {
                    PreparedAsset::Raw(_) => "raw",
                    PreparedAsset::Compiled(_) => "compiled",
                };
                tracing::info!(asset = %asset.key(), kind, "prepared");
            }
        }
        Some(Err(err)) => tracing::error!(%err, "battle preparation failed"),
        None => {}
    }
    Ok(())
}
