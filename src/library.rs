//! Plan library: scans a directory of plan files, reloading and disabling
//! entries as their backing files change (§4.2).
//!
//! Grounded in `original_source/src/workshop/Library.hxx`/`PlanLibrary.cxx`/
//! `PlanUpdate.cxx`: one `PlanEntry` per file-system entry whose name passes
//! [`crate::plan::is_valid_plan_name`], a 60-second revisit throttle once
//! the directory has been scanned, and a disable-with-cooldown mechanism for
//! entries that fail to stat or parse. `MultiLibrary` composes several
//! `Library` instances (first directory wins, §4.2's `plan_directories`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, info, warn};

use crate::config::intervals;
use crate::plan::{self, Plan};

struct PlanEntry {
    plan: Option<Arc<Plan>>,
    deinstalled: bool,
    mtime: Option<SystemTime>,
    disabled_until: Option<Instant>,
}

impl PlanEntry {
    fn new() -> Self {
        Self {
            plan: None,
            deinstalled: false,
            mtime: None,
            disabled_until: None,
        }
    }

    fn clear(&mut self) {
        self.plan = None;
        self.mtime = None;
    }

    fn is_disabled(&self, now: Instant) -> bool {
        self.disabled_until.is_some_and(|until| now < until)
    }

    fn is_available(&self, now: Instant) -> bool {
        !self.deinstalled && !self.is_disabled(now)
    }

    fn disable(&mut self, now: Instant, duration: Duration) {
        self.disabled_until = Some(now + duration);
    }

    fn enable(&mut self) {
        self.disabled_until = None;
    }
}

/// Scans one directory and maintains its plan entries.
pub struct Library {
    path: PathBuf,
    plans: HashMap<String, PlanEntry>,
    next_plans_check: Option<Instant>,
    dir_mtime: Option<SystemTime>,
}

impl Library {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            plans: HashMap::new(),
            next_plans_check: None,
            dir_mtime: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rescans the directory if `force` or the revisit cooldown has
    /// elapsed. Returns whether anything changed.
    pub async fn update(&mut self, now: Instant, force: bool) -> bool {
        let dir_metadata = match tokio::fs::metadata(&self.path).await {
            Ok(m) if m.is_dir() => m,
            Ok(_) => {
                warn!(path = %self.path.display(), "plan directory is not a directory");
                return false;
            }
            Err(error) => {
                warn!(path = %self.path.display(), %error, "failed to stat plan directory");
                return false;
            }
        };

        let new_mtime = dir_metadata.modified().ok();
        if !force
            && new_mtime == self.dir_mtime
            && self.next_plans_check.is_some_and(|next| now < next)
        {
            return false;
        }

        let modified = self.update_plans(now).await;
        self.dir_mtime = new_mtime;
        self.next_plans_check = Some(now + intervals::LIBRARY_REVISIT);
        modified
    }

    async fn update_plans(&mut self, now: Instant) -> bool {
        let mut entries = match tokio::fs::read_dir(&self.path).await {
            Ok(entries) => entries,
            Err(error) => {
                warn!(path = %self.path.display(), %error, "failed to read plan directory");
                return false;
            }
        };

        let mut seen = std::collections::HashSet::new();
        let mut modified = false;

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(error) => {
                    warn!(path = %self.path.display(), %error, "error while reading plan directory");
                    break;
                }
            };

            let name = entry.file_name().to_string_lossy().into_owned();
            if !plan::is_valid_plan_name(&name) {
                continue;
            }
            seen.insert(name.clone());

            let is_new = !self.plans.contains_key(&name);
            if is_new {
                self.plans.insert(name.clone(), PlanEntry::new());
                modified = true;
            }

            let plan_entry = self.plans.get_mut(&name).expect("just inserted");
            if self.update_plan(&name, plan_entry, now).await {
                modified = true;
            }
        }

        let removed: Vec<String> = self
            .plans
            .keys()
            .filter(|name| !seen.contains(*name))
            .cloned()
            .collect();
        for name in removed {
            info!(plan = %name, "removed plan");
            self.plans.remove(&name);
            modified = true;
        }

        modified
    }

    /// Re-checks one entry's backing file, reloading the plan if its mtime
    /// changed. Returns whether the entry's disposition changed.
    async fn update_plan(&self, name: &str, entry: &mut PlanEntry, now: Instant) -> bool {
        let was_available = entry.is_available(now);

        if !self.check_plan_modified(name, entry, now).await {
            return entry.is_available(now) != was_available;
        }

        if entry.plan.is_none() && !self.load_plan(name, entry, now).await {
            return false;
        }

        self.validate_plan(entry, now) != was_available
    }

    async fn check_plan_modified(&self, name: &str, entry: &mut PlanEntry, now: Instant) -> bool {
        let plan_path = self.path.join(name);
        let metadata = match tokio::fs::metadata(&plan_path).await {
            Ok(metadata) => metadata,
            Err(error) => {
                if error.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %plan_path.display(), %error, "failed to stat plan file");
                }
                entry.clear();
                return false;
            }
        };

        if !metadata.is_file() {
            entry.clear();
            entry.disable(now, intervals::DISABLE_MISSING);
            return false;
        }

        let new_mtime = metadata.modified().ok();
        if new_mtime != entry.mtime {
            entry.enable();
            entry.plan = None;
            entry.mtime = new_mtime;
        }

        !entry.is_disabled(now)
    }

    async fn load_plan(&self, name: &str, entry: &mut PlanEntry, now: Instant) -> bool {
        debug!(plan = %name, "loading plan");
        let plan_path = self.path.join(name);
        match plan::load_plan_file(&plan_path).await {
            Ok(loaded) => {
                entry.plan = Some(Arc::new(loaded));
                true
            }
            Err(error) => {
                warn!(plan = %name, %error, "failed to load plan");
                entry.disable(now, intervals::DISABLE_PARSE_FAILURE);
                false
            }
        }
    }

    fn validate_plan(&self, entry: &mut PlanEntry, now: Instant) -> bool {
        // The executable's own existence is checked lazily by the spawn
        // service at run time (§1 Non-goals exclude local filesystem
        // probing of the spawn target); this only enforces the directory
        // scan's freshness window.
        let _ = now;
        entry.deinstalled = false;
        entry.plan.is_some()
    }

    /// Looks up one plan by name, re-validating it first.
    pub async fn get(&mut self, now: Instant, name: &str) -> Option<Arc<Plan>> {
        self.plans.get(name)?;
        self.check_plan_modified_and_load(name, now).await;
        let entry = self.plans.get(name)?;
        if !entry.is_available(now) {
            return None;
        }
        entry.plan.clone()
    }

    async fn check_plan_modified_and_load(&mut self, name: &str, now: Instant) {
        let Some(mut entry) = self.plans.remove(name) else { return };
        self.update_plan(name, &mut entry, now).await;
        self.plans.insert(name.to_string(), entry);
    }

    /// All plan names currently available (not disabled, not deinstalled).
    pub fn available_names(&self, now: Instant) -> Vec<String> {
        self.plans
            .iter()
            .filter(|(_, entry)| entry.is_available(now))
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// Composes several [`Library`] instances: first directory to have the
/// plan wins (§4.2's `plan_directories`, first-match order).
pub struct MultiLibrary {
    libraries: Vec<Library>,
}

impl MultiLibrary {
    pub fn new(paths: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            libraries: paths.into_iter().map(Library::new).collect(),
        }
    }

    pub async fn update(&mut self, now: Instant, force: bool) -> bool {
        let mut modified = false;
        for library in &mut self.libraries {
            if library.update(now, force).await {
                modified = true;
            }
        }
        modified
    }

    pub async fn get(&mut self, now: Instant, name: &str) -> Option<Arc<Plan>> {
        for library in &mut self.libraries {
            if let Some(plan) = library.get(now, name).await {
                return Some(plan);
            }
        }
        None
    }

    pub fn available_names(&self, now: Instant) -> Vec<String> {
        let mut names = std::collections::HashSet::new();
        for library in &self.libraries {
            names.extend(library.available_names(now));
        }
        names.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn write_plan(dir: &Path, name: &str, contents: &str) {
        tokio::fs::write(dir.join(name), contents).await.unwrap();
    }

    #[tokio::test]
    async fn loads_valid_plans_and_skips_invalid_names() {
        let dir = tempfile::tempdir().unwrap();
        write_plan(dir.path(), "build", "exec /bin/true\n").await;
        write_plan(dir.path(), "has space", "exec /bin/true\n").await;

        let mut library = Library::new(dir.path().to_path_buf());
        let now = Instant::now();
        assert!(library.update(now, true).await);

        assert!(library.get(now, "build").await.is_some());
        assert!(library.get(now, "has space").await.is_none());
    }

    #[tokio::test]
    async fn removed_file_removes_plan_entry() {
        let dir = tempfile::tempdir().unwrap();
        write_plan(dir.path(), "build", "exec /bin/true\n").await;

        let mut library = Library::new(dir.path().to_path_buf());
        let now = Instant::now();
        library.update(now, true).await;
        assert!(library.get(now, "build").await.is_some());

        tokio::fs::remove_file(dir.path().join("build")).await.unwrap();
        library.update(now, true).await;
        assert!(library.get(now, "build").await.is_none());
    }

    #[tokio::test]
    async fn invalid_plan_file_gets_disabled() {
        let dir = tempfile::tempdir().unwrap();
        write_plan(dir.path(), "broken", "no_such_directive\n").await;

        let mut library = Library::new(dir.path().to_path_buf());
        let now = Instant::now();
        library.update(now, true).await;
        assert!(library.get(now, "broken").await.is_none());
    }

    #[tokio::test]
    async fn multi_library_first_match_wins() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        write_plan(dir_a.path(), "shared", "exec /bin/a\n").await;
        write_plan(dir_b.path(), "shared", "exec /bin/b\n").await;

        let mut multi = MultiLibrary::new([dir_a.path().to_path_buf(), dir_b.path().to_path_buf()]);
        let now = Instant::now();
        multi.update(now, true).await;

        let plan = multi.get(now, "shared").await.unwrap();
        assert_eq!(plan.args, vec!["/bin/a".to_string()]);
    }

    #[test]
    fn disable_cooldowns_match_original_source() {
        assert_eq!(intervals::DISABLE_MISSING, Duration::from_secs(60));
        assert_eq!(intervals::DISABLE_PARSE_FAILURE, Duration::from_secs(600));
    }
}
