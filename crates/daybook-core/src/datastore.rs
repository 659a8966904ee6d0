use std::fs;
use std::io::{self, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::datetime::normalize_date;
use crate::model::{Category, Event, ItemId, Reminder, Task};

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Named persisted collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Events,
    Reminders,
    Tasks,
    Categories,
}

impl Collection {
    pub const ALL: [Collection; 4] = [
        Collection::Events,
        Collection::Reminders,
        Collection::Tasks,
        Collection::Categories,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Collection::Events => "events",
            Collection::Reminders => "reminders",
            Collection::Tasks => "tasks",
            Collection::Categories => "taskCategories",
        }
    }

    pub fn file_name(self) -> String {
        format!("{}.json", self.key())
    }
}

/// Broadcast after every successful write to a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataChanged {
    pub collection: Collection,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("corrupt JSON in {}: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{} does not hold a collection", path.display())]
    NotACollection { path: PathBuf },
}

impl StoreError {
    /// The file was read but its contents are unusable.
    pub fn is_corrupt(&self) -> bool {
        matches!(self, StoreError::Corrupt { .. } | StoreError::NotACollection { .. })
    }
}

/// A record type stored as one collection.
pub trait Record: Serialize + DeserializeOwned + Clone {
    const COLLECTION: Collection;

    /// Called for entries of the date-keyed map layout before decoding.
    fn adopt_map_key(_key: &str, _entry: &mut Value) {}
}

impl Record for Event {
    const COLLECTION: Collection = Collection::Events;
}

impl Record for Reminder {
    const COLLECTION: Collection = Collection::Reminders;

    fn adopt_map_key(key: &str, entry: &mut Value) {
        if let Value::Object(map) = entry {
            let has_date = map
                .get("date")
                .and_then(Value::as_str)
                .is_some_and(|date| !date.trim().is_empty());
            if !has_date {
                map.insert("date".to_string(), Value::String(key.to_string()));
            }
        }
    }
}

impl Record for Task {
    const COLLECTION: Collection = Collection::Tasks;
}

impl Record for Category {
    const COLLECTION: Collection = Collection::Categories;
}

pub type EventRepository<'a> = Repository<'a, Event>;
pub type ReminderRepository<'a> = Repository<'a, Reminder>;
pub type TaskRepository<'a> = Repository<'a, Task>;
pub type CategoryRepository<'a> = Repository<'a, Category>;

#[derive(Debug)]
pub struct DataStore {
    pub data_dir: PathBuf,
    changes: broadcast::Sender<DataChanged>,
}

impl DataStore {
    #[tracing::instrument(skip(data_dir))]
    pub fn open(data_dir: &Path) -> anyhow::Result<Self> {
        let data_dir = data_dir.to_path_buf();
        fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create {}", data_dir.display()))?;

        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);

        info!(data_dir = %data_dir.display(), "opened datastore");

        Ok(Self { data_dir, changes })
    }

    pub fn path_for(&self, collection: Collection) -> PathBuf {
        self.data_dir.join(collection.file_name())
    }

    pub fn events(&self) -> EventRepository<'_> {
        Repository::new(self)
    }

    pub fn reminders(&self) -> ReminderRepository<'_> {
        Repository::new(self)
    }

    pub fn tasks(&self) -> TaskRepository<'_> {
        Repository::new(self)
    }

    pub fn categories(&self) -> CategoryRepository<'_> {
        Repository::new(self)
    }

    /// Receives a [`DataChanged`] for every write made through this store.
    pub fn subscribe(&self) -> broadcast::Receiver<DataChanged> {
        self.changes.subscribe()
    }

    fn notify_changed(&self, collection: Collection) {
        let receivers = self
            .changes
            .send(DataChanged { collection })
            .unwrap_or(0);
        debug!(collection = collection.key(), receivers, "data changed");
    }

    pub fn next_event_id(&self, events: &[Event]) -> ItemId {
        ItemId::Int(events.iter().filter_map(|e| e.id.as_int()).max().unwrap_or(0) + 1)
    }

    #[tracing::instrument(skip(self, event), fields(id = %event.id))]
    pub fn add_event(&self, event: Event) -> anyhow::Result<Event> {
        let mut events = self.events().load_for_write()?;
        if events.iter().any(|existing| existing.id == event.id) {
            return Err(anyhow!("event id already in use: {}", event.id));
        }
        events.push(event.clone());
        self.events().save(&events)?;
        Ok(event)
    }

    /// Applies `edit` to the event whose id matches `token`.
    #[tracing::instrument(skip(self, edit))]
    pub fn update_event<F>(&self, token: &str, edit: F) -> anyhow::Result<Event>
    where
        F: FnOnce(&mut Event) -> anyhow::Result<()>,
    {
        let mut events = self.events().load_for_write()?;
        let event = events
            .iter_mut()
            .find(|e| e.id.matches(token))
            .ok_or_else(|| anyhow!("event not found: {token}"))?;
        edit(event)?;
        let updated = event.clone();
        self.events().save(&events)?;
        Ok(updated)
    }

    #[tracing::instrument(skip(self))]
    pub fn delete_event(&self, token: &str) -> anyhow::Result<Event> {
        let mut events = self.events().load_for_write()?;
        let idx = events
            .iter()
            .position(|e| e.id.matches(token))
            .ok_or_else(|| anyhow!("event not found: {token}"))?;
        let removed = events.remove(idx);
        self.events().save(&events)?;
        Ok(removed)
    }

    #[tracing::instrument(skip(self, reminder))]
    pub fn add_reminder(&self, reminder: Reminder) -> anyhow::Result<Reminder> {
        let mut reminders = self.reminders().load_for_write()?;
        reminders.push(reminder.clone());
        self.reminders().save(&reminders)?;
        Ok(reminder)
    }

    #[tracing::instrument(skip(self))]
    pub fn delete_reminder(&self, token: &str) -> anyhow::Result<Reminder> {
        let mut reminders = self.reminders().load_for_write()?;
        let idx = reminders
            .iter()
            .enumerate()
            .position(|(idx, r)| match &r.id {
                Some(id) => id.matches(token),
                None => token == format!("idx{idx}"),
            })
            .ok_or_else(|| anyhow!("reminder not found: {token}"))?;
        let removed = reminders.remove(idx);
        self.reminders().save(&reminders)?;
        Ok(removed)
    }

    #[tracing::instrument(skip(self, task))]
    pub fn add_task(&self, task: Task) -> anyhow::Result<Task> {
        let mut tasks = self.tasks().load_for_write()?;
        tasks.push(task.clone());
        self.tasks().save(&tasks)?;
        Ok(task)
    }

    #[tracing::instrument(skip(self))]
    pub fn set_task_done(&self, token: &str, done: bool) -> anyhow::Result<Task> {
        let mut tasks = self.tasks().load_for_write()?;
        let task = tasks
            .iter_mut()
            .find(|t| t.id.matches(token))
            .ok_or_else(|| anyhow!("task not found: {token}"))?;
        task.done = done;
        let updated = task.clone();
        self.tasks().save(&tasks)?;
        Ok(updated)
    }

    #[tracing::instrument(skip(self))]
    pub fn delete_task(&self, token: &str) -> anyhow::Result<Task> {
        let mut tasks = self.tasks().load_for_write()?;
        let idx = tasks
            .iter()
            .position(|t| t.id.matches(token))
            .ok_or_else(|| anyhow!("task not found: {token}"))?;
        let removed = tasks.remove(idx);
        self.tasks().save(&tasks)?;
        Ok(removed)
    }

    /// Rewrites task dates that are not in canonical form. Returns how many
    /// tasks changed; nothing is written when none did.
    #[tracing::instrument(skip(self))]
    pub fn normalize_task_dates(&self) -> anyhow::Result<usize> {
        let mut tasks = self.tasks().load_for_write()?;
        let mut changed = 0_usize;
        for task in &mut tasks {
            let normalized = normalize_date(&task.date);
            if task.date != normalized {
                debug!(id = %task.id, from = %task.date, to = %normalized, "normalizing task date");
                task.date = normalized;
                changed += 1;
            }
        }
        if changed > 0 {
            self.tasks().save(&tasks)?;
        }
        info!(changed, "task date migration finished");
        Ok(changed)
    }

    #[tracing::instrument(skip(self, category))]
    pub fn add_category(&self, category: Category) -> anyhow::Result<Category> {
        let mut categories = self.categories().load_for_write()?;
        categories.push(category.clone());
        self.categories().save(&categories)?;
        Ok(category)
    }

    /// Removes a category and clears it from every task that referenced it.
    #[tracing::instrument(skip(self))]
    pub fn delete_category(&self, token: &str) -> anyhow::Result<Category> {
        let mut categories = self.categories().load_for_write()?;
        let idx = categories
            .iter()
            .position(|c| c.id.matches(token))
            .ok_or_else(|| anyhow!("category not found: {token}"))?;
        let removed = categories.remove(idx);
        self.categories().save(&categories)?;

        let removed_id = removed.id.to_string();
        let mut tasks = self.tasks().load_for_write()?;
        let mut cleared = 0_usize;
        for task in &mut tasks {
            if task.category == removed_id {
                task.category.clear();
                cleared += 1;
            }
        }
        if cleared > 0 {
            self.tasks().save(&tasks)?;
        }
        info!(category = %removed_id, cleared, "deleted category");
        Ok(removed)
    }
}

pub fn new_text_id(prefix: &str) -> ItemId {
    ItemId::Text(format!("{prefix}:{}", Uuid::new_v4().simple()))
}

/// Typed access to one collection file.
#[derive(Debug)]
pub struct Repository<'a, T> {
    store: &'a DataStore,
    marker: PhantomData<T>,
}

impl<'a, T: Record> Repository<'a, T> {
    fn new(store: &'a DataStore) -> Self {
        Self {
            store,
            marker: PhantomData,
        }
    }

    pub fn path(&self) -> PathBuf {
        self.store.path_for(T::COLLECTION)
    }

    /// Loads the collection, reporting why it could not be read.
    ///
    /// A missing file is an empty collection, not an error.
    pub fn try_load(&self) -> Result<Vec<T>, StoreError> {
        let path = self.path();
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        decode_collection(&path, &raw)
    }

    /// Loads the collection, falling back to an empty one on any error.
    ///
    /// Unreadable JSON is moved aside to `<file>.corrupt` so the next write
    /// starts clean without destroying the original bytes.
    #[tracing::instrument(skip(self), fields(collection = T::COLLECTION.key()))]
    pub fn load(&self) -> Vec<T> {
        match self.try_load() {
            Ok(items) => {
                debug!(count = items.len(), "loaded collection");
                items
            }
            Err(err) => {
                warn!(error = %err, "collection unreadable; using empty default");
                if err.is_corrupt() {
                    self.quarantine();
                }
                vec![]
            }
        }
    }

    /// Loads the collection ahead of a write.
    ///
    /// Corrupt files are moved aside first, as in [`Repository::load`]. A
    /// file that exists but cannot be read is an error, so the write never
    /// replaces contents it could not see.
    #[tracing::instrument(skip(self), fields(collection = T::COLLECTION.key()))]
    pub fn load_for_write(&self) -> anyhow::Result<Vec<T>> {
        match self.try_load() {
            Ok(items) => Ok(items),
            Err(err) if err.is_corrupt() => {
                warn!(error = %err, "collection corrupt; starting a fresh one");
                self.quarantine();
                Ok(vec![])
            }
            Err(err) => Err(err).with_context(|| {
                format!("refusing to overwrite unreadable {}", T::COLLECTION.file_name())
            }),
        }
    }

    #[tracing::instrument(skip(self, items), fields(collection = T::COLLECTION.key(), count = items.len()))]
    pub fn save(&self, items: &[T]) -> anyhow::Result<()> {
        let path = self.path();
        save_json_atomic(&path, items)
            .with_context(|| format!("failed to save {}", T::COLLECTION.file_name()))?;
        self.store.notify_changed(T::COLLECTION);
        Ok(())
    }

    fn quarantine(&self) {
        let path = self.path();
        let target = path.with_extension("json.corrupt");
        match fs::rename(&path, &target) {
            Ok(()) => warn!(
                from = %path.display(),
                to = %target.display(),
                "moved corrupt collection aside"
            ),
            Err(err) => warn!(
                file = %path.display(),
                error = %err,
                "failed to move corrupt collection aside"
            ),
        }
    }
}

fn decode_collection<T: Record>(path: &Path, raw: &[u8]) -> Result<Vec<T>, StoreError> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(vec![]);
    }

    let value: Value = serde_json::from_slice(raw).map_err(|source| StoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;

    let entries: Vec<Value> = match value {
        Value::Array(items) => items,
        Value::Object(map) => {
            debug!(file = %path.display(), "collection stored as map; flattening");
            map.into_iter()
                .flat_map(|(key, value)| {
                    let mut entries = match value {
                        Value::Array(items) => items,
                        other => vec![other],
                    };
                    for entry in &mut entries {
                        T::adopt_map_key(&key, entry);
                    }
                    entries
                })
                .collect()
        }
        Value::Null => vec![],
        _ => {
            return Err(StoreError::NotACollection {
                path: path.to_path_buf(),
            });
        }
    };

    let mut out = Vec::with_capacity(entries.len());
    for (idx, entry) in entries.into_iter().enumerate() {
        if entry.is_null() {
            continue;
        }
        match serde_json::from_value::<T>(entry) {
            Ok(item) => out.push(item),
            Err(err) => warn!(
                file = %path.display(),
                index = idx,
                error = %err,
                "skipping malformed entry"
            ),
        }
    }
    Ok(out)
}

fn save_json_atomic<T: Serialize>(path: &Path, items: &[T]) -> anyhow::Result<()> {
    debug!(file = %path.display(), count = items.len(), "saving json atomically");

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut temp, items)?;
    writeln!(temp)?;
    temp.flush()?;

    temp.persist(path)
        .map_err(|err| anyhow!("failed to persist {}: {}", path.display(), err))?;

    Ok(())
}
