//! Attribute pipeline applied on every value write and read
//!
//! Write order: mtime, plugins (registration order), history link,
//! encryption. Read order: decryption, plugins (reverse order). History
//! versions are read back with `Store::get_history`.
//!
//! Toggles are store-wide and apply to subsequent writes only.

pub mod crypt;
pub mod plugin;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::Expire;
use crate::error::{StoreError, StoreResult};
use crate::record::Entry;
use crate::txlog::TxSink;

pub use crypt::PasswordRing;
pub use plugin::{PluginLoader, PluginRegistry};

pub const ATTR_MTIME: &[u8] = b"mtime";
pub const ATTR_CRYPT: &[u8] = b"crypt";
pub const ATTR_HISTORY: &[u8] = b"history";

/// Names only the pipeline may write.
pub const RESERVED_ATTRS: [&[u8]; 3] = [ATTR_MTIME, ATTR_CRYPT, ATTR_HISTORY];

pub fn is_reserved(name: &[u8]) -> bool {
    RESERVED_ATTRS.contains(&name)
}

/// What a handler sees: the entry being written or read, plus call context.
pub struct AttrContext<'a> {
    pub entry: &'a mut Entry,
    /// Password from the call's options
    pub password: Option<&'a str>,
    pub now: SystemTime,
}

/// A named value transform with an encode (write) and decode (read) side.
pub trait AttrHandler: Send + Sync {
    fn name(&self) -> &str;
    fn encode(&self, ctx: &mut AttrContext<'_>) -> StoreResult<()>;
    fn decode(&self, ctx: &mut AttrContext<'_>) -> StoreResult<()>;
}

/// Stamps `mtime` with `secs.nanos` since the Unix epoch.
pub struct MtimeHandler;

impl AttrHandler for MtimeHandler {
    fn name(&self) -> &str {
        "mtime"
    }

    fn encode(&self, ctx: &mut AttrContext<'_>) -> StoreResult<()> {
        let since = ctx.now.duration_since(UNIX_EPOCH).unwrap_or_default();
        let stamp = format!("{}.{:09}", since.as_secs(), since.subsec_nanos());
        ctx.entry.set_attr(ATTR_MTIME, stamp.into_bytes());
        Ok(())
    }

    fn decode(&self, _ctx: &mut AttrContext<'_>) -> StoreResult<()> {
        Ok(())
    }
}

/// Parse an `mtime` attribute back into a time.
pub fn parse_mtime(raw: &[u8]) -> Option<SystemTime> {
    let text = std::str::from_utf8(raw).ok()?;
    let (secs, nanos) = text.split_once('.')?;
    let d = Duration::new(secs.parse().ok()?, nanos.parse().ok()?);
    UNIX_EPOCH.checked_add(d)
}

/// One row of [`AttrManager::information`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttrInfo {
    pub name: String,
    /// Plugin reference; `None` for built-ins
    pub source: Option<PathBuf>,
    pub detail: String,
}

struct LoadedPlugin {
    handler: Arc<dyn AttrHandler>,
    source: PathBuf,
}

/// Store-wide attribute state.
#[derive(Default)]
pub struct AttrManager {
    mtime: bool,
    history: bool,
    encrypt: bool,
    expire: Option<Duration>,
    passwords: PasswordRing,
    plugins: Vec<LoadedPlugin>,
    loader: Option<Arc<dyn PluginLoader>>,
}

impl AttrManager {
    pub fn enable_mtime(&mut self, on: bool) {
        self.mtime = on;
    }

    pub fn enable_history(&mut self, on: bool) {
        self.history = on;
    }

    pub fn history_enabled(&self) -> bool {
        self.history
    }

    /// Turn write encryption on or off. A password file replaces the default
    /// password and extends the ring. The ring stays usable for reads when
    /// encryption is turned off.
    pub fn enable_encryption(&mut self, on: bool, pass_file: Option<&Path>) -> StoreResult<()> {
        if let Some(path) = pass_file {
            let n = self.passwords.load_file(path)?;
            tracing::info!(count = n, path = %path.display(), "loaded encryption passwords");
        }
        self.encrypt = on;
        Ok(())
    }

    /// Setting a default password also turns write encryption on.
    pub fn set_default_password(&mut self, password: &str) {
        self.passwords.set_default(password);
        self.encrypt = true;
    }

    pub fn add_decryption_password(&mut self, password: &str) {
        self.passwords.add(password);
    }

    /// Default lifetime for writes that carry no expiration. `None` clears it.
    pub fn set_expiration_duration(&mut self, duration: Option<Duration>) -> StoreResult<()> {
        if duration.is_some_and(|d| d.is_zero()) {
            return Err(StoreError::Config(
                "default expiration of zero is not allowed; pass None to clear it".into(),
            ));
        }
        self.expire = duration;
        Ok(())
    }

    /// Resolve the expiration of a write: the explicit one, else the default.
    pub fn resolve_expire(&self, explicit: Option<&Expire>, now: SystemTime) -> StoreResult<Option<u64>> {
        match (explicit, self.expire) {
            (Some(e), _) => e.resolve(now).map(Some),
            (None, Some(d)) => Expire::After(d).resolve(now).map(Some),
            (None, None) => Ok(None),
        }
    }

    pub fn set_plugin_loader(&mut self, loader: Arc<dyn PluginLoader>) {
        self.loader = Some(loader);
    }

    fn loader(&self) -> StoreResult<&Arc<dyn PluginLoader>> {
        self.loader
            .as_ref()
            .ok_or_else(|| StoreError::Config("no plugin loader configured".into()))
    }

    /// Resolve a transaction sink through the configured loader.
    pub fn load_tx_sink(&self, path: &Path) -> StoreResult<Arc<dyn TxSink>> {
        self.loader()?.load_tx_sink(path)
    }

    /// Load a plugin through the configured loader and append it to the
    /// pipeline.
    pub fn add_plugin(&mut self, path: &Path) -> StoreResult<()> {
        let handler = self.loader()?.load(path)?;
        let name = handler.name().to_string();
        if is_reserved(name.as_bytes()) {
            return Err(StoreError::Config(format!("plugin name '{}' is reserved", name)));
        }
        if self.plugins.iter().any(|p| p.handler.name() == name) {
            return Err(StoreError::Config(format!("plugin '{}' already loaded", name)));
        }
        tracing::info!(plugin = %name, path = %path.display(), "attribute plugin loaded");
        self.plugins.push(LoadedPlugin { handler, source: path.to_path_buf() });
        Ok(())
    }

    pub fn information(&self) -> Vec<AttrInfo> {
        let mut out = Vec::new();
        let builtin = |name: &str, detail: String| AttrInfo { name: name.into(), source: None, detail };
        if self.mtime {
            out.push(builtin("mtime", "stamps secs.nanos on every write".into()));
        }
        if self.history {
            out.push(builtin("history", "keeps previous versions".into()));
        }
        if self.encrypt || !self.passwords.is_empty() {
            out.push(builtin(
                "crypt",
                format!(
                    "aes256gcm, writes {}, {} password(s)",
                    if self.encrypt { "encrypted" } else { "plain" },
                    self.passwords.len()
                ),
            ));
        }
        if let Some(d) = self.expire {
            out.push(builtin("expire", format!("default lifetime {}s", d.as_secs())));
        }
        for p in &self.plugins {
            out.push(AttrInfo {
                name: p.handler.name().to_string(),
                source: Some(p.source.clone()),
                detail: "plugin".into(),
            });
        }
        out
    }

    /// Run the write side. `history_link` names the saved previous version.
    pub fn encode(&self, ctx: &mut AttrContext<'_>, history_link: Option<Vec<u8>>) -> StoreResult<()> {
        if self.mtime {
            MtimeHandler.encode(ctx)?;
        } else {
            ctx.entry.remove_attr(ATTR_MTIME);
        }

        for p in &self.plugins {
            p.handler.encode(ctx)?;
        }

        match history_link {
            Some(link) => ctx.entry.set_attr(ATTR_HISTORY, link),
            None => {
                ctx.entry.remove_attr(ATTR_HISTORY);
            }
        }

        let password = match ctx.password {
            Some(p) => Some(p),
            None if self.encrypt => Some(self.passwords.default_password().ok_or_else(|| {
                StoreError::Config("encryption is enabled but no default password is set".into())
            })?),
            None => None,
        };
        match password {
            Some(p) => {
                ctx.entry.value = crypt::seal(p, &ctx.entry.value)?;
                ctx.entry.set_attr(ATTR_CRYPT, crypt::CRYPT_TAG.to_vec());
            }
            None => {
                ctx.entry.remove_attr(ATTR_CRYPT);
            }
        }
        Ok(())
    }

    /// Run the read side, leaving the plain value in `ctx.entry.value`.
    pub fn decode(&self, ctx: &mut AttrContext<'_>) -> StoreResult<()> {
        if let Some(tag) = ctx.entry.attr(ATTR_CRYPT) {
            if tag != crypt::CRYPT_TAG {
                return Err(StoreError::Decrypt(format!(
                    "unknown cipher '{}'",
                    String::from_utf8_lossy(tag)
                )));
            }
            ctx.entry.value = self.passwords.decrypt(&ctx.entry.value, ctx.password)?;
        }
        for p in self.plugins.iter().rev() {
            p.handler.decode(ctx)?;
        }
        Ok(())
    }
}
