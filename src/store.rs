//! Typed, validated, persistent configuration store.
//!
//! Every YAML document under `<base>/config/` is owned by this store. Reads
//! are cached by (mtime, size); writes validate the full document, emit
//! canonical YAML and replace the file atomically via temp+rename. A
//! per-path advisory lock serializes read-modify-write sequences.

use std::{
    any::Any,
    collections::{HashMap, HashSet},
    fs::{self, File, Permissions},
    io::Write,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::SystemTime,
};

use log::debug;
use serde::{de::DeserializeOwned, Serialize};
use tempfile::NamedTempFile;

use crate::{
    paths::Paths,
    schema::validate::{validate_set, ConfigSet, ValidationIssue},
    schema::{DomainsFile, GlobalConfig, SecretBundle, ServicesFile, UsersFile},
    Error, Result,
};

/// A YAML document managed by the store.
pub trait Document:
    Serialize + DeserializeOwned + Default + Clone + Send + Sync + 'static
{
    /// Short name used in log lines.
    const NAME: &'static str;
    /// File mode of the on-disk document.
    const MODE: u32 = 0o644;

    fn file_path(paths: &Paths) -> PathBuf;

    /// Comment block written above the documented minimal default.
    fn header() -> &'static str;

    /// Intra-document validation issues.
    fn validate(&self) -> Vec<ValidationIssue> {
        Vec::new()
    }
}

impl Document for GlobalConfig {
    const NAME: &'static str = "global";

    fn file_path(paths: &Paths) -> PathBuf {
        paths.global_file()
    }

    fn header() -> &'static str {
        "# System identity and per-service defaults.\n"
    }

    fn validate(&self) -> Vec<ValidationIssue> {
        collect_issues(&ConfigSet {
            global: Some(self),
            ..Default::default()
        })
    }
}

impl Document for UsersFile {
    const NAME: &'static str = "users";

    fn file_path(paths: &Paths) -> PathBuf {
        paths.users_file()
    }

    fn header() -> &'static str {
        "# User accounts. Passwords live in secrets.yaml, never here.\n"
    }

    fn validate(&self) -> Vec<ValidationIssue> {
        collect_issues(&ConfigSet {
            users: &self.users,
            // domain existence is a cross-document rule
            ..Default::default()
        })
        .into_iter()
        .filter(|i| i.rule != "user_domains_exist")
        .collect()
    }
}

impl Document for DomainsFile {
    const NAME: &'static str = "domains";

    fn file_path(paths: &Paths) -> PathBuf {
        paths.domains_file()
    }

    fn header() -> &'static str {
        "# Hosted domains: mail routing, host records and certificate policy.\n"
    }

    fn validate(&self) -> Vec<ValidationIssue> {
        collect_issues(&ConfigSet {
            domains: &self.domains,
            ..Default::default()
        })
    }
}

impl Document for ServicesFile {
    const NAME: &'static str = "services";

    fn file_path(paths: &Paths) -> PathBuf {
        paths.services_file()
    }

    fn header() -> &'static str {
        "# Managed services and their container bindings.\n"
    }

    fn validate(&self) -> Vec<ValidationIssue> {
        collect_issues(&ConfigSet {
            services: Some(self),
            ..Default::default()
        })
    }
}

impl Document for SecretBundle {
    const NAME: &'static str = "secrets";
    const MODE: u32 = 0o600;

    fn file_path(paths: &Paths) -> PathBuf {
        paths.secrets_file()
    }

    fn header() -> &'static str {
        "# Sensitive material. Keep out of version control.\n"
    }
}

fn collect_issues(set: &ConfigSet) -> Vec<ValidationIssue> {
    match validate_set(set) {
        Ok(()) => Vec::new(),
        Err(Error::ConfigValidate(issues)) => issues,
        Err(_) => unreachable!("validate_set only yields CONFIG_VALIDATE"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    mtime: SystemTime,
    size: u64,
}

impl FileStamp {
    fn of(path: &Path) -> Result<Self> {
        let meta = fs::metadata(path).map_err(|e| Error::io(path, e))?;
        Ok(Self {
            mtime: meta.modified().map_err(|e| Error::io(path, e))?,
            size: meta.len(),
        })
    }
}

struct CacheEntry {
    stamp: FileStamp,
    value: Arc<dyn Any + Send + Sync>,
}

/// Exclusive advisory lock on a document, held across read-modify-write.
pub(crate) struct PathLock {
    file: File,
}

impl PathLock {
    pub(crate) fn acquire(target: &Path) -> Result<Self> {
        let lock_path = lock_path_of(target);
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| Error::io(&lock_path, e))?;
        fs3::FileExt::lock_exclusive(&file).map_err(|e| Error::io(&lock_path, e))?;
        Ok(Self { file })
    }
}

impl Drop for PathLock {
    fn drop(&mut self) {
        fs3::FileExt::unlock(&self.file).ok();
    }
}

fn lock_path_of(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    target.with_file_name(name)
}

/// Writes `bytes` to `path` atomically: temp file in the same directory,
/// fsync, chmod, rename over the destination.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8], mode: u32) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::PathNotAbsolute(path.to_owned()))?;
    fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    let mut tmp = NamedTempFile::new_in(parent).map_err(|e| Error::io(parent, e))?;
    tmp.write_all(bytes).map_err(|e| Error::io(path, e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| Error::io(path, e))?;
    tmp.as_file()
        .set_permissions(Permissions::from_mode(mode))
        .map_err(|e| Error::io(path, e))?;
    tmp.persist(path).map_err(|e| Error::io(path, e.error))?;
    Ok(())
}

/// The configuration store of one environment.
pub struct ConfigStore {
    paths: Paths,
    cache: Mutex<HashMap<PathBuf, CacheEntry>>,
    backed_up: Mutex<HashSet<PathBuf>>,
}

impl ConfigStore {
    pub fn new(paths: Paths) -> Self {
        Self {
            paths,
            cache: Mutex::new(HashMap::new()),
            backed_up: Mutex::new(HashSet::new()),
        }
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    /// Loads, parses and validates a document, serving cached results while
    /// the file's mtime and size are unchanged.
    pub fn load<D: Document>(&self) -> Result<Arc<D>> {
        let path = D::file_path(&self.paths);
        let stamp = FileStamp::of(&path)?;

        if let Some(entry) = self.cache.lock()?.get(&path) {
            if entry.stamp == stamp {
                if let Ok(doc) = entry.value.clone().downcast::<D>() {
                    return Ok(doc);
                }
            }
        }

        let text = fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;
        let doc: D = serde_yaml::from_str(&text).map_err(|source| Error::ConfigParse {
            file: path.clone(),
            source,
        })?;
        let issues = doc.validate();
        if !issues.is_empty() {
            return Err(Error::ConfigValidate(issues));
        }

        let doc = Arc::new(doc);
        self.cache.lock()?.insert(
            path,
            CacheEntry {
                stamp,
                value: doc.clone(),
            },
        );
        Ok(doc)
    }

    /// Loads a document, or its default when the file does not exist yet.
    pub fn load_or_default<D: Document>(&self) -> Result<Arc<D>> {
        if D::file_path(&self.paths).exists() {
            self.load()
        } else {
            Ok(Arc::new(D::default()))
        }
    }

    /// Validates, emits and atomically replaces a document.
    pub fn save<D: Document>(&self, doc: &D) -> Result<()> {
        let path = D::file_path(&self.paths);
        let _lock = PathLock::acquire(&path)?;
        self.save_locked(doc, &path)
    }

    /// Read-modify-write under the per-path lock.
    pub fn update<D: Document, F>(&self, mutate: F) -> Result<Arc<D>>
    where
        F: FnOnce(&mut D) -> Result<()>,
    {
        let path = D::file_path(&self.paths);
        let _lock = PathLock::acquire(&path)?;
        let mut doc = if path.exists() {
            self.load::<D>()?.as_ref().clone()
        } else {
            D::default()
        };
        mutate(&mut doc)?;
        self.save_locked(&doc, &path)?;
        Ok(Arc::new(doc))
    }

    fn save_locked<D: Document>(&self, doc: &D, path: &Path) -> Result<()> {
        let issues = doc.validate();
        if !issues.is_empty() {
            return Err(Error::ConfigValidate(issues));
        }
        let emitted = emit(doc, path)?;
        self.backup_once(path)?;
        write_atomic(path, emitted.as_bytes(), D::MODE)?;
        debug!("{}: saved {}", D::NAME, path.display());
        self.cache.lock()?.remove(path);
        Ok(())
    }

    /// Copies the committed file to `<name>.bak` on the first write of this
    /// store instance's lifetime.
    fn backup_once(&self, path: &Path) -> Result<()> {
        let mut backed_up = self.backed_up.lock()?;
        if backed_up.contains(path) || !path.exists() {
            backed_up.insert(path.to_owned());
            return Ok(());
        }
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(".bak");
        let backup = path.with_file_name(name);
        fs::copy(path, &backup).map_err(|e| Error::io(&backup, e))?;
        backed_up.insert(path.to_owned());
        Ok(())
    }

    /// Writes documented minimal defaults for every missing document.
    pub fn initialize_defaults(&self) -> Result<()> {
        self.paths.ensure_layout()?;
        self.init_default::<GlobalConfig>()?;
        self.init_default::<UsersFile>()?;
        self.init_default::<DomainsFile>()?;
        self.init_missing_services()?;
        self.init_default::<SecretBundle>()?;
        Ok(())
    }

    fn init_default<D: Document>(&self) -> Result<()> {
        let path = D::file_path(&self.paths);
        if path.exists() {
            return Ok(());
        }
        let body = emit(&D::default(), &path)?;
        write_atomic(&path, format!("{}{}", D::header(), body).as_bytes(), D::MODE)
    }

    fn init_missing_services(&self) -> Result<()> {
        let path = ServicesFile::file_path(&self.paths);
        if path.exists() {
            return Ok(());
        }
        let body = emit(&ServicesFile::default_fleet(), &path)?;
        write_atomic(
            &path,
            format!("{}{}", ServicesFile::header(), body).as_bytes(),
            ServicesFile::MODE,
        )
    }

    /// Drops every cached parse. Called on environment switches and by the
    /// watcher when external edits land.
    pub fn invalidate(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
    }

    pub fn transaction(&self) -> Transaction<'_> {
        Transaction {
            store: self,
            global: None,
            users: None,
            domains: None,
            services: None,
            secrets: None,
        }
    }
}

fn emit<D: Document>(doc: &D, path: &Path) -> Result<String> {
    serde_yaml::to_string(doc).map_err(|source| Error::ConfigParse {
        file: path.to_owned(),
        source,
    })
}

/// A multi-document save applied only if the composite state validates.
///
/// Staged documents replace their on-disk counterparts for validation; on
/// any failure the whole set is discarded and nothing is written.
pub struct Transaction<'a> {
    store: &'a ConfigStore,
    global: Option<GlobalConfig>,
    users: Option<UsersFile>,
    domains: Option<DomainsFile>,
    services: Option<ServicesFile>,
    secrets: Option<SecretBundle>,
}

impl Transaction<'_> {
    pub fn stage_global(&mut self, doc: GlobalConfig) -> &mut Self {
        self.global = Some(doc);
        self
    }

    pub fn stage_users(&mut self, doc: UsersFile) -> &mut Self {
        self.users = Some(doc);
        self
    }

    pub fn stage_domains(&mut self, doc: DomainsFile) -> &mut Self {
        self.domains = Some(doc);
        self
    }

    pub fn stage_services(&mut self, doc: ServicesFile) -> &mut Self {
        self.services = Some(doc);
        self
    }

    pub fn stage_secrets(&mut self, doc: SecretBundle) -> &mut Self {
        self.secrets = Some(doc);
        self
    }

    pub fn commit(self) -> Result<()> {
        let global = match &self.global {
            Some(doc) => Arc::new(doc.clone()),
            None => self.store.load_or_default::<GlobalConfig>()?,
        };
        let users = match &self.users {
            Some(doc) => Arc::new(doc.clone()),
            None => self.store.load_or_default::<UsersFile>()?,
        };
        let domains = match &self.domains {
            Some(doc) => Arc::new(doc.clone()),
            None => self.store.load_or_default::<DomainsFile>()?,
        };
        let services = match &self.services {
            Some(doc) => Arc::new(doc.clone()),
            None => self.store.load_or_default::<ServicesFile>()?,
        };

        validate_set(&ConfigSet {
            global: Some(&global),
            users: &users.users,
            domains: &domains.domains,
            services: Some(&services),
            environments: &[],
        })?;

        if let Some(doc) = self.global {
            self.store.save(&doc)?;
        }
        if let Some(doc) = self.users {
            self.store.save(&doc)?;
        }
        if let Some(doc) = self.domains {
            self.store.save(&doc)?;
        }
        if let Some(doc) = self.services {
            self.store.save(&doc)?;
        }
        if let Some(doc) = self.secrets {
            self.store.save(&doc)?;
        }
        Ok(())
    }
}

/// Loads the full configuration set for cross-document validation.
pub fn load_config_set(store: &ConfigStore) -> Result<LoadedConfig> {
    Ok(LoadedConfig {
        global: store.load_or_default::<GlobalConfig>()?,
        users: store.load_or_default::<UsersFile>()?,
        domains: store.load_or_default::<DomainsFile>()?,
        services: store.load_or_default::<ServicesFile>()?,
        secrets: store.load_or_default::<SecretBundle>()?,
    })
}

/// An owned snapshot of every configuration document.
pub struct LoadedConfig {
    pub global: Arc<GlobalConfig>,
    pub users: Arc<UsersFile>,
    pub domains: Arc<DomainsFile>,
    pub services: Arc<ServicesFile>,
    pub secrets: Arc<SecretBundle>,
}

impl LoadedConfig {
    pub fn validate(&self) -> Result<()> {
        validate_set(&ConfigSet {
            global: Some(&self.global),
            users: &self.users.users,
            domains: &self.domains.domains,
            services: Some(&self.services),
            environments: &[],
        })
    }
}

#[cfg(test)]
mod test {
    use std::fs;

    use test_log::test;

    use super::Document;
    use crate::{
        schema::{DomainsFile, SecretBundle, UsersFile},
        test::{sample_domain, sample_user, TestDir},
        Error,
    };

    #[test]
    fn test_initialize_defaults() {
        let testdir = TestDir::new();
        let ctx = testdir.context("dev").unwrap();
        let paths = ctx.paths();
        for path in [
            paths.global_file(),
            paths.users_file(),
            paths.domains_file(),
            paths.services_file(),
            paths.secrets_file(),
        ] {
            assert!(path.is_file(), "{:?} missing", path);
        }
        let text = fs::read_to_string(paths.users_file()).unwrap();
        assert!(text.starts_with('#'));
    }

    #[test]
    fn test_load_roundtrip_and_cache() {
        let testdir = TestDir::new();
        let ctx = testdir.context("dev").unwrap();
        let store = ctx.store();

        let mut file = DomainsFile::default();
        file.domains.push(sample_domain("local.dev"));
        store.save(&file).unwrap();

        let loaded = store.load::<DomainsFile>().unwrap();
        assert_eq!(loaded.as_ref(), &file);
        // second load hits the cache, same Arc
        let again = store.load::<DomainsFile>().unwrap();
        assert!(std::sync::Arc::ptr_eq(&loaded, &again));
    }

    #[test]
    fn test_external_change_invalidates_cache() {
        let testdir = TestDir::new();
        let ctx = testdir.context("dev").unwrap();
        let store = ctx.store();

        let mut file = DomainsFile::default();
        file.domains.push(sample_domain("local.dev"));
        store.save(&file).unwrap();
        let first = store.load::<DomainsFile>().unwrap();

        file.domains.push(sample_domain("dev.local"));
        let emitted = serde_yaml::to_string(&file).unwrap();
        // external edit with a fresh mtime and size
        fs::write(store.paths().domains_file(), emitted).unwrap();

        let second = store.load::<DomainsFile>().unwrap();
        assert_eq!(second.domains.len(), 2);
        assert_ne!(first.domains.len(), second.domains.len());
    }

    #[test]
    fn test_atomic_replace_and_backup() {
        let testdir = TestDir::new();
        let ctx = testdir.context("dev").unwrap();
        let store = ctx.store();
        let path = store.paths().domains_file();
        let original = fs::read_to_string(&path).unwrap();

        let mut file = DomainsFile::default();
        file.domains.push(sample_domain("local.dev"));
        store.save(&file).unwrap();

        let backup = path.with_file_name("domains.yaml.bak");
        assert_eq!(fs::read_to_string(&backup).unwrap(), original);

        // no temp droppings next to the document
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "leftovers: {:?}", leftovers);
    }

    #[test]
    fn test_save_rejects_invalid() {
        let testdir = TestDir::new();
        let ctx = testdir.context("dev").unwrap();
        let store = ctx.store();

        let mut file = UsersFile::default();
        let mut user = sample_user("Admin", "local.dev");
        user.email = "broken".to_string();
        file.users.push(user);
        assert!(matches!(
            store.save(&file),
            Err(Error::ConfigValidate(_))
        ));
        // nothing written: default document intact
        let on_disk = store.load::<UsersFile>().unwrap();
        assert!(on_disk.users.is_empty());
    }

    #[test]
    fn test_transaction_discards_on_composite_failure() {
        let testdir = TestDir::new();
        let ctx = testdir.context("dev").unwrap();
        let store = ctx.store();

        // user references a domain that is not staged: composite invalid
        let mut users = UsersFile::default();
        users.users.push(sample_user("admin", "missing.dev"));
        let mut tx = store.transaction();
        tx.stage_users(users);
        assert!(matches!(tx.commit(), Err(Error::ConfigValidate(_))));
        assert!(store.load::<UsersFile>().unwrap().users.is_empty());

        // staging the domain as well makes the composite valid
        let mut users = UsersFile::default();
        users.users.push(sample_user("admin", "missing.dev"));
        let mut domains = DomainsFile::default();
        domains.domains.push(sample_domain("missing.dev"));
        let mut tx = store.transaction();
        tx.stage_users(users).stage_domains(domains);
        tx.commit().unwrap();
        assert_eq!(store.load::<UsersFile>().unwrap().users.len(), 1);
    }

    #[test]
    fn test_secrets_mode() {
        use std::os::unix::fs::PermissionsExt;

        let testdir = TestDir::new();
        let ctx = testdir.context("dev").unwrap();
        let store = ctx.store();
        let mut bundle = SecretBundle::default();
        bundle.set_password("admin", "s3cret".into());
        store.save(&bundle).unwrap();
        let mode = fs::metadata(store.paths().secrets_file())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
