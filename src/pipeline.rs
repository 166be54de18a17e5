//! Preparing a battle: fetch both players' states, derive the asset list,
//! download every asset and compile the shaders, all off the frame thread.
//!
//! The pipeline is all-or-nothing: it fulfills with the complete list of
//! prepared assets, in catalog order, or rejects with the first failure.

use std::fmt;
use std::sync::Arc;

use crate::CancelToken;
use crate::Error;
use crate::Executor;
use crate::ExecutorExt;
use crate::Future;
use crate::ThreadExecutor;
use crate::all;

/// Identifies a player.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(String);

impl UserId {
    /// Create an id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kinds of assets. Only shaders need compiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum AssetKind {
    /// Shader source, compiled after download.
    Shader,
    /// Texture data.
    Texture,
    /// Mesh data.
    Mesh,
    /// Sound data.
    Audio,
}

/// Names one downloadable asset.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AssetKey {
    /// Asset path or name.
    pub name: String,
    /// What the asset is.
    pub kind: AssetKind,
}

impl AssetKey {
    /// Create a key.
    pub fn new(name: impl Into<String>, kind: AssetKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    /// Returns whether the asset must be compiled.
    pub fn is_shader(&self) -> bool {
        self.kind == AssetKind::Shader
    }
}

impl fmt::Display for AssetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Remote state of one player, as returned by the [`StateService`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserState {
    /// Whose state this is.
    pub user: UserId,
    /// Assets the player brings into battle.
    pub loadout: Vec<AssetKey>,
}

/// A downloaded asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    /// The asset's key.
    pub key: AssetKey,
    /// Raw content.
    pub bytes: Arc<[u8]>,
}

/// A compiled shader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledAsset {
    /// The asset's key.
    pub key: AssetKey,
    /// Compiled output.
    pub bytes: Arc<[u8]>,
}

/// One entry of a prepared battle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreparedAsset {
    /// Used as downloaded.
    Raw(Asset),
    /// A shader after compilation.
    Compiled(CompiledAsset),
}

impl PreparedAsset {
    /// The key of the prepared asset.
    pub fn key(&self) -> &AssetKey {
        match self {
            Self::Raw(asset) => &asset.key,
            Self::Compiled(asset) => &asset.key,
        }
    }
}

/// Fetches player state from the game backend.
pub trait StateService: Send + Sync {
    /// Request the state of `user`.
    fn get_user_state(&self, user: &UserId) -> Future<UserState>;
}

/// Derives the assets a battle needs. Must be pure and cheap; it runs on
/// whichever thread delivers the states.
pub trait AssetCatalog: Send + Sync {
    /// The assets to prepare for a battle between `user` and `enemy`.
    fn asset_keys(&self, user: &UserState, enemy: &UserState) -> Vec<AssetKey>;
}

/// Downloads asset content. Called on the download executor.
pub trait AssetSource: Send + Sync {
    /// Fetch one asset.
    ///
    /// # Errors
    /// Will return `Err` on transport failures, or `Err(Error::Cancelled)` if
    /// it honors `cancel`.
    fn fetch(&self, key: &AssetKey, cancel: &CancelToken) -> Result<Asset, Error>;
}

/// Compiles shaders. Called on the compile executor.
pub trait ShaderCompiler: Send + Sync {
    /// Compile one shader.
    ///
    /// # Errors
    /// Will return `Err` if compilation fails.
    fn compile(&self, asset: Asset, cancel: &CancelToken) -> Result<CompiledAsset, Error>;
}

/// Both loadouts, user first, each key once.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadoutCatalog;

impl AssetCatalog for LoadoutCatalog {
    fn asset_keys(&self, user: &UserState, enemy: &UserState) -> Vec<AssetKey> {
        let mut keys: Vec<AssetKey> = Vec::with_capacity(user.loadout.len() + enemy.loadout.len());
        for key in user.loadout.iter().chain(&enemy.loadout) {
            if !keys.contains(key) {
                keys.push(key.clone());
            }
        }
        keys
    }
}

/// Runs the battle preparation pipeline against injected collaborators and
/// executors.
///
/// Downloads run on the download executor, shader compilation on the
/// compile executor. Pool sizes are the caller's choice: I/O bound downloads
/// usually get more workers than CPU bound compilation. Continuations
/// attached to already settled futures go through the dispatcher, a
/// [`ThreadExecutor`] unless replaced.
#[derive(Clone)]
pub struct BattlePreparer {
    states: Arc<dyn StateService>,
    catalog: Arc<dyn AssetCatalog>,
    source: Arc<dyn AssetSource>,
    compiler: Arc<dyn ShaderCompiler>,
    downloads: Arc<dyn Executor>,
    compiles: Arc<dyn Executor>,
    dispatch: Arc<dyn Executor>,
}

impl fmt::Debug for BattlePreparer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BattlePreparer").finish_non_exhaustive()
    }
}

impl BattlePreparer {
    /// Create a preparer using the [`LoadoutCatalog`].
    pub fn new(
        states: Arc<dyn StateService>,
        source: Arc<dyn AssetSource>,
        compiler: Arc<dyn ShaderCompiler>,
        downloads: Arc<dyn Executor>,
        compiles: Arc<dyn Executor>,
    ) -> Self {
        Self {
            states,
            catalog: Arc::new(LoadoutCatalog),
            source,
            compiler,
            downloads,
            compiles,
            dispatch: Arc::new(ThreadExecutor::new("battle-dispatch")),
        }
    }

    /// Replace the asset catalog.
    #[must_use]
    pub fn with_catalog(mut self, catalog: Arc<dyn AssetCatalog>) -> Self {
        self.catalog = catalog;
        self
    }

    /// Replace the executor used for continuations attached after settlement.
    #[must_use]
    pub fn with_dispatcher(mut self, dispatch: Arc<dyn Executor>) -> Self {
        self.dispatch = dispatch;
        self
    }

    /// Download one asset on the download executor.
    pub fn download_asset(&self, key: &AssetKey) -> Future<Asset> {
        let source = Arc::clone(&self.source);
        let key = key.clone();
        self.downloads.submit(move |cancel| {
            tracing::trace!(asset = %key, "downloading");
            source.fetch(&key, cancel)
        })
    }

    /// Compile one shader on the compile executor.
    pub fn compile_shader(&self, asset: Asset) -> Future<CompiledAsset> {
        compile_on(&*self.compiles, Arc::clone(&self.compiler), asset)
    }

    /// Download one asset, then compile it if it is a shader.
    pub fn prepare_asset(&self, key: &AssetKey) -> Future<PreparedAsset> {
        let download = self.download_asset(key);
        let prepared = if key.is_shader() {
            // Captures the compile stage only.
            let compiler = Arc::clone(&self.compiler);
            let compiles = Arc::clone(&self.compiles);
            let dispatch = Arc::clone(&self.dispatch);
            download.then(&*self.dispatch, move |asset| {
                let compiled = compile_on(&*compiles, compiler, asset);
                let mapped = compiled.then(&*dispatch, |asset| {
                    Ok::<_, Error>(PreparedAsset::Compiled(asset))
                });
                mapped.on_cancel(move || {
                    compiled.cancel();
                });
                mapped
            })
        } else {
            download.then(&*self.dispatch, |asset| Ok::<_, Error>(PreparedAsset::Raw(asset)))
        };
        prepared.on_cancel(move || {
            download.cancel();
        });
        prepared
    }

    /// Prepare a battle between `user` and `enemy`.
    ///
    /// Cancelling the returned future cancels the state requests and every
    /// download and compilation still in flight.
    pub fn prepare_battle(&self, user: &UserId, enemy: &UserId) -> Future<Vec<PreparedAsset>> {
        tracing::debug!(%user, %enemy, "preparing battle");
        let states = all([
            self.states.get_user_state(user),
            self.states.get_user_state(enemy),
        ]);

        let this = self.clone();
        let prepared = states.then(&*self.dispatch, move |states| {
            let [user_state, enemy_state]: [UserState; 2] = match states.try_into() {
                Ok(pair) => pair,
                Err(states) => {
                    return Future::failed(Error::msg(format!(
                        "expected 2 user states, got {}",
                        states.len()
                    )));
                }
            };
            let keys = this.catalog.asset_keys(&user_state, &enemy_state);
            tracing::debug!(assets = keys.len(), "fetched user states");
            all(keys.iter().map(|key| this.prepare_asset(key)).collect::<Vec<_>>())
        });

        prepared.on_cancel(move || {
            states.cancel();
        });
        let (user, enemy) = (user.clone(), enemy.clone());
        prepared.subscribe(move |outcome| match outcome {
            Ok(assets) => tracing::debug!(%user, %enemy, assets = assets.len(), "battle prepared"),
            Err(err) => tracing::warn!(%user, %enemy, %err, "battle preparation failed"),
        });
        prepared
    }
}

fn compile_on(
    compiles: &dyn Executor,
    compiler: Arc<dyn ShaderCompiler>,
    asset: Asset,
) -> Future<CompiledAsset> {
    compiles.submit(move |cancel| {
        tracing::trace!(asset = %asset.key, "compiling");
        compiler.compile(asset, cancel)
    })
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use web_time::Duration;

    use super::*;
    use crate::InlineExecutor;

    fn key(name: &str, kind: AssetKind) -> AssetKey {
        AssetKey::new(name, kind)
    }

    struct FixedStates;

    impl StateService for FixedStates {
        fn get_user_state(&self, user: &UserId) -> Future<UserState> {
            let loadout = match user.as_str() {
                "alice" => vec![key("hero.mesh", AssetKind::Mesh), key("fire.wgsl", AssetKind::Shader)],
                _ => vec![key("fire.wgsl", AssetKind::Shader), key("roar.ogg", AssetKind::Audio)],
            };
            Future::ready(UserState {
                user: user.clone(),
                loadout,
            })
        }
    }

    struct EchoSource;

    impl AssetSource for EchoSource {
        fn fetch(&self, key: &AssetKey, _cancel: &CancelToken) -> Result<Asset, Error> {
            Ok(Asset {
                key: key.clone(),
                bytes: Arc::from(key.name.as_bytes()),
            })
        }
    }

    #[derive(Default)]
    struct CountingCompiler(AtomicUsize);

    impl ShaderCompiler for CountingCompiler {
        fn compile(&self, asset: Asset, _cancel: &CancelToken) -> Result<CompiledAsset, Error> {
            self.0.fetch_add(1, Ordering::SeqCst);
            let mut bytes = b"spv:".to_vec();
            bytes.extend_from_slice(&asset.bytes);
            Ok(CompiledAsset {
                key: asset.key,
                bytes: Arc::from(bytes),
            })
        }
    }

    #[test]
    fn test_loadout_catalog_dedups_in_order() {
        let states = FixedStates;
        let user = states.get_user_state(&"alice".into()).get(None).unwrap();
        let enemy = states.get_user_state(&"bob".into()).get(None).unwrap();
        let names: Vec<_> = LoadoutCatalog
            .asset_keys(&user, &enemy)
            .into_iter()
            .map(|k| k.name)
            .collect();
        assert_eq!(vec!["hero.mesh", "fire.wgsl", "roar.ogg"], names);
    }

    #[test]
    fn test_inline_pipeline() {
        let compiler = Arc::new(CountingCompiler::default());
        let preparer = BattlePreparer::new(
            Arc::new(FixedStates),
            Arc::new(EchoSource),
            compiler.clone(),
            Arc::new(InlineExecutor),
            Arc::new(InlineExecutor),
        );

        let assets = preparer
            .prepare_battle(&"alice".into(), &"bob".into())
            .get(Some(Duration::from_secs(5)))
            .unwrap();

        assert_eq!(3, assets.len());
        assert!(matches!(&assets[0], PreparedAsset::Raw(a) if &*a.bytes == b"hero.mesh"));
        assert!(matches!(&assets[1], PreparedAsset::Compiled(c) if &*c.bytes == b"spv:fire.wgsl"));
        assert_eq!("roar.ogg", assets[2].key().name);
        assert_eq!(1, compiler.0.load(Ordering::SeqCst));
    }

    #[test]
    fn test_non_shader_skips_compiler() {
        let compiler = Arc::new(CountingCompiler::default());
        let preparer = BattlePreparer::new(
            Arc::new(FixedStates),
            Arc::new(EchoSource),
            compiler.clone(),
            Arc::new(InlineExecutor),
            Arc::new(InlineExecutor),
        );
        let prepared = preparer
            .prepare_asset(&key("grass.png", AssetKind::Texture))
            .get(Some(Duration::from_secs(5)))
            .unwrap();
        assert!(matches!(prepared, PreparedAsset::Raw(_)));
        assert_eq!(0, compiler.0.load(Ordering::SeqCst));
    }
}
