//! Planner domain library: one priority-ordered, date-indexed item store shared by the
//! task, note, and event collections, and the coordinator that keeps it in step with a
//! remote store. The pure parts (store, ordering, reorder) do no I/O; only `sync` talks
//! to a [`remote::RemoteStore`].

pub mod core {
    use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
    use serde::de::DeserializeOwned;
    use serde::{Deserialize, Serialize};
    use std::{fmt, str::FromStr};

    /* ------------------------------- IDs ------------------------------- */

    /// Opaque item identifier assigned by the remote store on creation.
    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct ItemId(pub String);

    impl ItemId {
        pub fn new(id: impl Into<String>) -> Self {
            Self(id.into())
        }

        pub fn generate() -> Self {
            Self(uuid::Uuid::new_v4().to_string())
        }

        pub fn as_str(&self) -> &str {
            &self.0
        }
    }

    impl fmt::Display for ItemId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    impl From<&str> for ItemId {
        fn from(s: &str) -> Self {
            Self(s.to_string())
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct OwnerId(pub String);

    impl OwnerId {
        pub fn new(id: impl Into<String>) -> Self {
            Self(id.into())
        }

        pub fn as_str(&self) -> &str {
            &self.0
        }
    }

    impl fmt::Display for OwnerId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    impl From<&str> for OwnerId {
        fn from(s: &str) -> Self {
            Self(s.to_string())
        }
    }

    /* ------------------------------ Date keys ------------------------------ */

    /// Calendar date used as the date-index key. Renders as `YYYY-MM-DD`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct DateKey(pub NaiveDate);

    impl DateKey {
        pub fn from_ymd(year: i32, month: u32, day: u32) -> Option<Self> {
            NaiveDate::from_ymd_opt(year, month, day).map(Self)
        }

        pub fn date(self) -> NaiveDate {
            self.0
        }
    }

    impl From<NaiveDate> for DateKey {
        fn from(date: NaiveDate) -> Self {
            Self(date)
        }
    }

    impl fmt::Display for DateKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0.format("%Y-%m-%d"))
        }
    }

    impl FromStr for DateKey {
        type Err = ValidationError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
                .map(Self)
                .map_err(|_| ValidationError::InvalidDate(s.to_string()))
        }
    }

    /* ---------------------------- Priority buckets ---------------------------- */

    /// Coarse priority category. Each bucket is ordered independently by rank.
    #[derive(
        Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    )]
    pub enum PriorityBucket {
        #[default]
        A,
        B,
        C,
        D,
    }

    impl PriorityBucket {
        pub const ALL: [PriorityBucket; 4] = [Self::A, Self::B, Self::C, Self::D];

        pub fn as_char(self) -> char {
            match self {
                Self::A => 'A',
                Self::B => 'B',
                Self::C => 'C',
                Self::D => 'D',
            }
        }

        pub fn from_char(c: char) -> Option<Self> {
            match c.to_ascii_uppercase() {
                'A' => Some(Self::A),
                'B' => Some(Self::B),
                'C' => Some(Self::C),
                'D' => Some(Self::D),
                _ => None,
            }
        }
    }

    impl fmt::Display for PriorityBucket {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.as_char())
        }
    }

    /// Accepts `A`, `a`, `#A`, and the Org-style cookie `[#A]`.
    impl FromStr for PriorityBucket {
        type Err = ValidationError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            let trimmed = s.trim();
            let inner = trimmed
                .strip_prefix("[#")
                .and_then(|rest| rest.strip_suffix(']'))
                .or_else(|| trimmed.strip_prefix('#'))
                .unwrap_or(trimmed);
            let mut chars = inner.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => {
                    Self::from_char(c).ok_or_else(|| ValidationError::UnknownBucket(s.to_string()))
                }
                _ => Err(ValidationError::UnknownBucket(s.to_string())),
            }
        }
    }

    /// One separately ordered group: a bucket on a date.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    pub struct GroupKey {
        pub date: DateKey,
        pub bucket: PriorityBucket,
    }

    impl GroupKey {
        pub fn new(date: DateKey, bucket: PriorityBucket) -> Self {
            Self { date, bucket }
        }
    }

    impl fmt::Display for GroupKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}/{}", self.date, self.bucket)
        }
    }

    /* ------------------------------ Collections ------------------------------ */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum CollectionKind {
        Tasks,
        Notes,
        Events,
    }

    impl CollectionKind {
        pub const ALL: [CollectionKind; 3] = [Self::Tasks, Self::Notes, Self::Events];

        pub fn as_str(self) -> &'static str {
            match self {
                Self::Tasks => "tasks",
                Self::Notes => "notes",
                Self::Events => "events",
            }
        }

        pub fn singular(self) -> &'static str {
            match self {
                Self::Tasks => "task",
                Self::Notes => "note",
                Self::Events => "event",
            }
        }
    }

    impl fmt::Display for CollectionKind {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

    impl FromStr for CollectionKind {
        type Err = ValidationError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            match s.trim().to_ascii_lowercase().as_str() {
                "task" | "tasks" => Ok(Self::Tasks),
                "note" | "notes" => Ok(Self::Notes),
                "event" | "events" => Ok(Self::Events),
                _ => Err(ValidationError::UnknownKind(s.to_string())),
            }
        }
    }

    /// Collection-specific payload carried by an [`Item`].
    pub trait ItemContent: Clone + fmt::Debug + PartialEq + Serialize + DeserializeOwned {
        const KIND: CollectionKind;

        fn title(&self) -> &str;

        fn validate(&self) -> Result<(), ValidationError> {
            require_title(Self::KIND, self.title())
        }
    }

    fn require_title(kind: CollectionKind, title: &str) -> Result<(), ValidationError> {
        if title.trim().is_empty() {
            return Err(ValidationError::EmptyTitle(kind));
        }
        Ok(())
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TaskContent {
        pub title: String,
        #[serde(default)]
        pub done: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub notes: Option<String>,
    }

    impl TaskContent {
        pub fn new(title: impl Into<String>) -> Self {
            Self {
                title: title.into(),
                done: false,
                notes: None,
            }
        }
    }

    impl ItemContent for TaskContent {
        const KIND: CollectionKind = CollectionKind::Tasks;

        fn title(&self) -> &str {
            &self.title
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct NoteContent {
        pub title: String,
        #[serde(default)]
        pub body: String,
    }

    impl NoteContent {
        pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
            Self {
                title: title.into(),
                body: body.into(),
            }
        }
    }

    impl ItemContent for NoteContent {
        const KIND: CollectionKind = CollectionKind::Notes;

        fn title(&self) -> &str {
            &self.title
        }
    }

    /// Calendar event. Times are local wall-clock times on the scheduled date.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct EventContent {
        pub title: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub start: Option<NaiveTime>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub end: Option<NaiveTime>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub location: Option<String>,
    }

    impl EventContent {
        pub fn new(title: impl Into<String>) -> Self {
            Self {
                title: title.into(),
                start: None,
                end: None,
                location: None,
            }
        }

        pub fn between(mut self, start: NaiveTime, end: NaiveTime) -> Self {
            self.start = Some(start);
            self.end = Some(end);
            self
        }
    }

    impl ItemContent for EventContent {
        const KIND: CollectionKind = CollectionKind::Events;

        fn title(&self) -> &str {
            &self.title
        }

        fn validate(&self) -> Result<(), ValidationError> {
            require_title(Self::KIND, &self.title)?;
            if let (Some(start), Some(end)) = (self.start, self.end) {
                if end < start {
                    return Err(ValidationError::EventEndsBeforeStart { start, end });
                }
            }
            Ok(())
        }
    }

    /* ------------------------------- Items ------------------------------- */

    /// The unit stored, indexed by date, and ordered within its bucket.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Item<C> {
        pub id: ItemId,
        pub owner_id: OwnerId,
        pub scheduled_date: DateKey,
        pub bucket: PriorityBucket,
        /// Positive ordinal inside (owner, date, bucket).
        pub rank: u32,
        pub updated_at: DateTime<Utc>,
        #[serde(default)]
        pub is_deleted: bool,
        pub content: C,
    }

    impl<C> Item<C> {
        pub fn group(&self) -> GroupKey {
            GroupKey::new(self.scheduled_date, self.bucket)
        }

        /// Live items take part in the date index and in bucket ordering.
        pub fn is_live(&self) -> bool {
            !self.is_deleted
        }
    }

    /// A validated item on its way to the remote store, which assigns the id.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct NewItem<C> {
        pub owner_id: OwnerId,
        pub scheduled_date: DateKey,
        pub bucket: PriorityBucket,
        pub rank: u32,
        pub updated_at: DateTime<Utc>,
        pub content: C,
    }

    impl<C> NewItem<C> {
        pub fn with_id(self, id: ItemId) -> Item<C> {
            Item {
                id,
                owner_id: self.owner_id,
                scheduled_date: self.scheduled_date,
                bucket: self.bucket,
                rank: self.rank,
                updated_at: self.updated_at,
                is_deleted: false,
                content: self.content,
            }
        }
    }

    /// User input for a new item; checked before anything leaves the process.
    #[derive(Debug, Clone, PartialEq)]
    pub struct ItemDraft<C> {
        pub scheduled_date: Option<DateKey>,
        pub bucket: PriorityBucket,
        /// Explicit rank; `None` appends to the end of the bucket.
        pub rank: Option<u32>,
        pub content: C,
    }

    impl<C> ItemDraft<C> {
        pub fn new(content: C) -> Self {
            Self {
                scheduled_date: None,
                bucket: PriorityBucket::default(),
                rank: None,
                content,
            }
        }

        pub fn on(mut self, date: DateKey) -> Self {
            self.scheduled_date = Some(date);
            self
        }

        pub fn in_bucket(mut self, bucket: PriorityBucket) -> Self {
            self.bucket = bucket;
            self
        }

        pub fn at_rank(mut self, rank: u32) -> Self {
            self.rank = Some(rank);
            self
        }
    }

    /// Partial field update. Absent fields are left untouched; `updated_at` always moves.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct ItemPatch<C> {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub scheduled_date: Option<DateKey>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub bucket: Option<PriorityBucket>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub rank: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub is_deleted: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub content: Option<C>,
        pub updated_at: DateTime<Utc>,
    }

    impl<C: Clone + PartialEq> ItemPatch<C> {
        pub fn touch(at: DateTime<Utc>) -> Self {
            Self {
                scheduled_date: None,
                bucket: None,
                rank: None,
                is_deleted: None,
                content: None,
                updated_at: at,
            }
        }

        /// Patch carrying every field that differs between two images of one item.
        pub fn between(before: &Item<C>, after: &Item<C>) -> Self {
            let mut patch = Self::touch(after.updated_at);
            if before.scheduled_date != after.scheduled_date {
                patch.scheduled_date = Some(after.scheduled_date);
            }
            if before.bucket != after.bucket {
                patch.bucket = Some(after.bucket);
            }
            if before.rank != after.rank {
                patch.rank = Some(after.rank);
            }
            if before.is_deleted != after.is_deleted {
                patch.is_deleted = Some(after.is_deleted);
            }
            if before.content != after.content {
                patch.content = Some(after.content.clone());
            }
            patch
        }

        pub fn apply(&self, item: &mut Item<C>) {
            if let Some(date) = self.scheduled_date {
                item.scheduled_date = date;
            }
            if let Some(bucket) = self.bucket {
                item.bucket = bucket;
            }
            if let Some(rank) = self.rank {
                item.rank = rank;
            }
            if let Some(deleted) = self.is_deleted {
                item.is_deleted = deleted;
            }
            if let Some(content) = &self.content {
                item.content = content.clone();
            }
            item.updated_at = self.updated_at;
        }

        pub fn is_touch_only(&self) -> bool {
            self.scheduled_date.is_none()
                && self.bucket.is_none()
                && self.rank.is_none()
                && self.is_deleted.is_none()
                && self.content.is_none()
        }
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    /// Input rejected before any local or remote mutation happens.
    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum ValidationError {
        #[error("a scheduled date is required")]
        MissingDate,
        #[error("invalid date {0:?}; expected YYYY-MM-DD")]
        InvalidDate(String),
        #[error("unknown priority bucket {0:?}; expected one of A, B, C, D")]
        UnknownBucket(String),
        #[error("unknown collection {0:?}; expected task, note, or event")]
        UnknownKind(String),
        #[error("rank must be a positive integer")]
        ZeroRank,
        #[error("rank {rank} is already taken in {group}")]
        RankTaken { group: GroupKey, rank: u32 },
        #[error("item {id} belongs to {actual}, not {expected}")]
        OwnerMismatch {
            id: ItemId,
            expected: OwnerId,
            actual: OwnerId,
        },
        #[error("{} title must not be empty", .0.singular())]
        EmptyTitle(CollectionKind),
        #[error("event ends at {end} before it starts at {start}")]
        EventEndsBeforeStart { start: NaiveTime, end: NaiveTime },
    }

}

pub mod store {
    //! Normalized collection store: items keyed by id plus a derived date index.
    //!
    //! Every public mutation leaves `ids_by_date` consistent with `by_id`: an id is
    //! listed under a date iff the item is scheduled on that date and not soft-deleted.
    //! Lists are kept in date-index order (bucket, rank, `updated_at`, id).

    use super::core::{DateKey, GroupKey, Item, ItemId, OwnerId, ValidationError};
    use super::ordering;
    use indexmap::IndexMap;
    use std::collections::{BTreeMap, HashSet};

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum InvariantViolation {
        #[error("{date} lists unknown item {id}")]
        DanglingId { date: DateKey, id: ItemId },
        #[error("{date} lists deleted item {id}")]
        DeletedListed { date: DateKey, id: ItemId },
        #[error("item {id} is listed under {listed} but scheduled for {scheduled}")]
        Misfiled {
            id: ItemId,
            listed: DateKey,
            scheduled: DateKey,
        },
        #[error("item {id} is listed more than once")]
        DuplicateListing { id: ItemId },
        #[error("live item {id} is missing from the date index")]
        Unindexed { id: ItemId },
        #[error("{date} has an empty id list")]
        EmptyDate { date: DateKey },
        #[error("rank {rank} appears more than once in {group}")]
        DuplicateRank { group: GroupKey, rank: u32 },
    }

    /// Rollback image of a set of items. `None` records that the item did not exist.
    #[derive(Debug, Clone, PartialEq)]
    pub struct Snapshot<C> {
        entries: Vec<(ItemId, Option<Item<C>>)>,
    }

    impl<C> Snapshot<C> {
        pub fn ids(&self) -> impl Iterator<Item = &ItemId> {
            self.entries.iter().map(|(id, _)| id)
        }

        pub fn entries(&self) -> &[(ItemId, Option<Item<C>>)] {
            &self.entries
        }

        pub fn image(&self, id: &ItemId) -> Option<&Option<Item<C>>> {
            self.entries
                .iter()
                .find(|(entry, _)| entry == id)
                .map(|(_, image)| image)
        }

        pub fn len(&self) -> usize {
            self.entries.len()
        }

        pub fn is_empty(&self) -> bool {
            self.entries.is_empty()
        }

        pub(crate) fn replace(&mut self, id: &ItemId, image: Option<Item<C>>) {
            match self.entries.iter_mut().find(|(entry, _)| entry == id) {
                Some(slot) => slot.1 = image,
                None => self.entries.push((id.clone(), image)),
            }
        }

        pub(crate) fn into_entries(self) -> Vec<(ItemId, Option<Item<C>>)> {
            self.entries
        }
    }

    /// Canonical item state for one owner's collection.
    #[derive(Debug, Clone)]
    pub struct CollectionStore<C> {
        owner: OwnerId,
        by_id: IndexMap<ItemId, Item<C>>,
        ids_by_date: BTreeMap<DateKey, Vec<ItemId>>,
    }

    impl<C: Clone> CollectionStore<C> {
        pub fn new(owner: OwnerId) -> Self {
            Self {
                owner,
                by_id: IndexMap::new(),
                ids_by_date: BTreeMap::new(),
            }
        }

        pub fn owner(&self) -> &OwnerId {
            &self.owner
        }

        pub fn get(&self, id: &ItemId) -> Option<&Item<C>> {
            self.by_id.get(id)
        }

        pub fn contains(&self, id: &ItemId) -> bool {
            self.by_id.contains_key(id)
        }

        /// Number of items held, soft-deleted ones included.
        pub fn len(&self) -> usize {
            self.by_id.len()
        }

        pub fn is_empty(&self) -> bool {
            self.by_id.is_empty()
        }

        pub fn by_id(&self) -> &IndexMap<ItemId, Item<C>> {
            &self.by_id
        }

        pub fn ids_by_date(&self) -> &BTreeMap<DateKey, Vec<ItemId>> {
            &self.ids_by_date
        }

        pub fn ids_on(&self, date: DateKey) -> &[ItemId] {
            self.ids_by_date
                .get(&date)
                .map(Vec::as_slice)
                .unwrap_or(&[])
        }

        /// Live items scheduled on `date`, in date-index order.
        pub fn items_on(&self, date: DateKey) -> impl Iterator<Item = &Item<C>> {
            self.ids_on(date)
                .iter()
                .filter_map(move |id| self.by_id.get(id))
        }

        /// Live items of one (date, bucket) group in rank order.
        pub fn group_items(&self, group: GroupKey) -> Vec<&Item<C>> {
            self.items_on(group.date)
                .filter(|item| item.bucket == group.bucket)
                .collect()
        }

        pub fn group_order(&self, group: GroupKey) -> Vec<ItemId> {
            self.group_items(group)
                .into_iter()
                .map(|item| item.id.clone())
                .collect()
        }

        /// Insert or replace one item. A changed date moves the id between date lists
        /// inside this call.
        pub fn upsert_one(&mut self, item: Item<C>) -> Result<(), ValidationError> {
            self.check_owner(&item)?;
            self.put(item);
            self.debug_verify();
            Ok(())
        }

        /// Replace everything listed under `date` with `items` (a full remote fetch for
        /// that date). Listed ids missing from `items` are dropped from the store.
        pub fn upsert_many(&mut self, date: DateKey, items: Vec<Item<C>>) -> Result<(), ValidationError> {
            for item in &items {
                self.check_owner(item)?;
            }
            let incoming: HashSet<&ItemId> = items.iter().map(|item| &item.id).collect();
            let stale: Vec<ItemId> = self
                .ids_on(date)
                .iter()
                .filter(|id| !incoming.contains(id))
                .cloned()
                .collect();
            for id in &stale {
                self.take(id);
            }
            for item in items {
                self.put(item);
            }
            self.debug_verify();
            Ok(())
        }

        /// Drop an item entirely. Unknown ids are a no-op.
        pub fn remove(&mut self, id: &ItemId) -> Option<Item<C>> {
            let removed = self.take(id);
            self.debug_verify();
            removed
        }

        /// Mark an item deleted and unlist it, keeping its content. Returns whether
        /// anything changed; unknown or already-deleted ids are a no-op.
        pub fn soft_delete(&mut self, id: &ItemId) -> bool {
            let Some(item) = self.by_id.get_mut(id) else {
                return false;
            };
            if item.is_deleted {
                return false;
            }
            item.is_deleted = true;
            let date = item.scheduled_date;
            self.unlist(date, id);
            self.debug_verify();
            true
        }

        pub fn snapshot<'a>(&self, ids: impl IntoIterator<Item = &'a ItemId>) -> Snapshot<C> {
            let mut seen = HashSet::new();
            let mut entries = Vec::new();
            for id in ids {
                if seen.insert(id) {
                    entries.push((id.clone(), self.by_id.get(id).cloned()));
                }
            }
            Snapshot { entries }
        }

        pub fn restore(&mut self, snapshot: Snapshot<C>) {
            for (id, image) in snapshot.entries {
                self.write_image(&id, image);
            }
            self.debug_verify();
        }

        /// Write an image produced from this store's own items, skipping the owner check.
        pub(crate) fn write_image(&mut self, id: &ItemId, image: Option<Item<C>>) {
            match image {
                Some(item) => self.put(item),
                None => {
                    self.take(id);
                }
            }
        }

        pub fn verify(&self) -> Result<(), InvariantViolation> {
            let mut listed = HashSet::new();
            for (date, ids) in &self.ids_by_date {
                if ids.is_empty() {
                    return Err(InvariantViolation::EmptyDate { date: *date });
                }
                for id in ids {
                    let Some(item) = self.by_id.get(id) else {
                        return Err(InvariantViolation::DanglingId {
                            date: *date,
                            id: id.clone(),
                        });
                    };
                    if item.is_deleted {
                        return Err(InvariantViolation::DeletedListed {
                            date: *date,
                            id: id.clone(),
                        });
                    }
                    if item.scheduled_date != *date {
                        return Err(InvariantViolation::Misfiled {
                            id: id.clone(),
                            listed: *date,
                            scheduled: item.scheduled_date,
                        });
                    }
                    if !listed.insert(id) {
                        return Err(InvariantViolation::DuplicateListing { id: id.clone() });
                    }
                }
            }
            for (id, item) in &self.by_id {
                if item.is_live() && !listed.contains(id) {
                    return Err(InvariantViolation::Unindexed { id: id.clone() });
                }
            }
            Ok(())
        }

        pub fn verify_group_ranks(&self, group: GroupKey) -> Result<(), InvariantViolation> {
            let mut ranks = HashSet::new();
            for item in self.group_items(group) {
                if !ranks.insert(item.rank) {
                    return Err(InvariantViolation::DuplicateRank {
                        group,
                        rank: item.rank,
                    });
                }
            }
            Ok(())
        }

        fn debug_verify(&self) {
            debug_assert!(
                self.verify().is_ok(),
                "date index drifted: {:?}",
                self.verify()
            );
        }

        fn check_owner(&self, item: &Item<C>) -> Result<(), ValidationError> {
            if item.owner_id != self.owner {
                return Err(ValidationError::OwnerMismatch {
                    id: item.id.clone(),
                    expected: self.owner.clone(),
                    actual: item.owner_id.clone(),
                });
            }
            Ok(())
        }

        fn put(&mut self, item: Item<C>) {
            let id = item.id.clone();
            let date = item.scheduled_date;
            let live = item.is_live();
            if let Some(previous) = self.by_id.insert(id.clone(), item) {
                if previous.is_live() {
                    self.unlist(previous.scheduled_date, &id);
                }
            }
            if live {
                self.list(date, id);
            }
        }

        fn take(&mut self, id: &ItemId) -> Option<Item<C>> {
            let removed = self.by_id.shift_remove(id)?;
            if removed.is_live() {
                self.unlist(removed.scheduled_date, id);
            }
            Some(removed)
        }

        fn list(&mut self, date: DateKey, id: ItemId) {
            let Self {
                by_id, ids_by_date, ..
            } = self;
            let ids = ids_by_date.entry(date).or_default();
            ids.push(id);
            ids.sort_by(|a, b| match (by_id.get(a), by_id.get(b)) {
                (Some(x), Some(y)) => ordering::index_order(x, y),
                _ => a.cmp(b),
            });
        }

        fn unlist(&mut self, date: DateKey, id: &ItemId) {
            if let Some(ids) = self.ids_by_date.get_mut(&date) {
                ids.retain(|listed| listed != id);
                if ids.is_empty() {
                    self.ids_by_date.remove(&date);
                }
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::core::{NoteContent, PriorityBucket};
        use chrono::{DateTime, Utc};

        fn day(d: u32) -> DateKey {
            DateKey::from_ymd(2025, 6, d).unwrap()
        }

        fn note(id: &str, date: DateKey, bucket: PriorityBucket, rank: u32) -> Item<NoteContent> {
            Item {
                id: ItemId::from(id),
                owner_id: OwnerId::from("me"),
                scheduled_date: date,
                bucket,
                rank,
                updated_at: DateTime::<Utc>::from_timestamp(0, 0).unwrap(),
                is_deleted: false,
                content: NoteContent::new(id, ""),
            }
        }

        fn store() -> CollectionStore<NoteContent> {
            CollectionStore::new(OwnerId::from("me"))
        }

        fn ids(list: &[ItemId]) -> Vec<&str> {
            list.iter().map(ItemId::as_str).collect()
        }

        #[test]
        fn date_lists_follow_bucket_then_rank() {
            let mut s = store();
            s.upsert_one(note("b1", day(1), PriorityBucket::B, 1)).unwrap();
            s.upsert_one(note("a2", day(1), PriorityBucket::A, 2)).unwrap();
            s.upsert_one(note("a1", day(1), PriorityBucket::A, 1)).unwrap();
            assert_eq!(ids(s.ids_on(day(1))), ["a1", "a2", "b1"]);
            assert_eq!(
                s.group_order(GroupKey::new(day(1), PriorityBucket::A)),
                vec![ItemId::from("a1"), ItemId::from("a2")]
            );
        }

        #[test]
        fn rescheduling_moves_between_date_lists() {
            let mut s = store();
            s.upsert_one(note("x", day(1), PriorityBucket::A, 1)).unwrap();
            s.upsert_one(note("x", day(2), PriorityBucket::A, 1)).unwrap();
            assert!(s.ids_on(day(1)).is_empty());
            assert!(!s.ids_by_date().contains_key(&day(1)));
            assert_eq!(ids(s.ids_on(day(2))), ["x"]);
            assert_eq!(s.len(), 1);
        }

        #[test]
        fn upsert_many_drops_stale_ids_for_that_date_only() {
            let mut s = store();
            s.upsert_one(note("keep", day(1), PriorityBucket::A, 1)).unwrap();
            s.upsert_one(note("gone", day(1), PriorityBucket::A, 2)).unwrap();
            s.upsert_one(note("other", day(2), PriorityBucket::A, 1)).unwrap();

            s.upsert_many(
                day(1),
                vec![
                    note("keep", day(1), PriorityBucket::A, 2),
                    note("new", day(1), PriorityBucket::A, 1),
                ],
            )
            .unwrap();

            assert_eq!(ids(s.ids_on(day(1))), ["new", "keep"]);
            assert!(!s.contains(&ItemId::from("gone")));
            assert_eq!(ids(s.ids_on(day(2))), ["other"]);
        }

        #[test]
        fn upsert_many_is_all_or_nothing_on_owner_mismatch() {
            let mut s = store();
            s.upsert_one(note("keep", day(1), PriorityBucket::A, 1)).unwrap();
            let mut foreign = note("intruder", day(1), PriorityBucket::A, 2);
            foreign.owner_id = OwnerId::from("someone-else");

            let err = s.upsert_many(day(1), vec![foreign]).unwrap_err();
            assert!(matches!(err, ValidationError::OwnerMismatch { .. }));
            assert_eq!(ids(s.ids_on(day(1))), ["keep"]);
        }

        #[test]
        fn soft_delete_unlists_but_keeps_content() {
            let mut s = store();
            s.upsert_one(note("x", day(1), PriorityBucket::A, 1)).unwrap();
            assert!(s.soft_delete(&ItemId::from("x")));
            assert!(!s.soft_delete(&ItemId::from("x")));
            assert!(s.ids_on(day(1)).is_empty());
            assert!(s.get(&ItemId::from("x")).unwrap().is_deleted);
            assert!(s.verify().is_ok());
        }

        #[test]
        fn remove_and_soft_delete_ignore_unknown_ids() {
            let mut s = store();
            assert!(s.remove(&ItemId::from("nope")).is_none());
            assert!(!s.soft_delete(&ItemId::from("nope")));
            assert!(s.is_empty());
        }

        #[test]
        fn snapshot_restore_brings_back_prior_state() {
            let mut s = store();
            s.upsert_one(note("x", day(1), PriorityBucket::A, 1)).unwrap();
            let snapshot = s.snapshot([&ItemId::from("x"), &ItemId::from("y")]);
            assert_eq!(snapshot.len(), 2);

            s.upsert_one(note("x", day(3), PriorityBucket::B, 4)).unwrap();
            s.upsert_one(note("y", day(1), PriorityBucket::A, 2)).unwrap();
            s.restore(snapshot);

            assert_eq!(ids(s.ids_on(day(1))), ["x"]);
            assert!(s.ids_on(day(3)).is_empty());
            assert!(!s.contains(&ItemId::from("y")));
        }

        #[test]
        fn duplicate_ranks_are_reported_per_group() {
            let mut s = store();
            s.upsert_one(note("x", day(1), PriorityBucket::A, 1)).unwrap();
            s.upsert_one(note("y", day(1), PriorityBucket::A, 1)).unwrap();
            s.upsert_one(note("z", day(1), PriorityBucket::B, 1)).unwrap();
            assert_eq!(
                s.verify_group_ranks(GroupKey::new(day(1), PriorityBucket::A)),
                Err(InvariantViolation::DuplicateRank {
                    group: GroupKey::new(day(1), PriorityBucket::A),
                    rank: 1
                })
            );
            assert!(s.verify_group_ranks(GroupKey::new(day(1), PriorityBucket::B)).is_ok());
        }
    }
}

pub mod ordering {
    //! Pure bucket arithmetic. Callers pass the items of one date; anything outside the
    //! requested bucket, and anything soft-deleted, is ignored.

    use super::core::{Item, ItemId, PriorityBucket};
    use serde::{Deserialize, Serialize};
    use std::cmp::Ordering;
    use std::collections::HashMap;

    /// A rank assignment for one item.
    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct RankChange {
        pub id: ItemId,
        pub rank: u32,
    }

    impl RankChange {
        pub fn new(id: impl Into<ItemId>, rank: u32) -> Self {
            Self { id: id.into(), rank }
        }
    }

    /// Order inside a bucket: rank, then `updated_at`, then id.
    pub fn rank_order<C>(a: &Item<C>, b: &Item<C>) -> Ordering {
        a.rank
            .cmp(&b.rank)
            .then_with(|| a.updated_at.cmp(&b.updated_at))
            .then_with(|| a.id.cmp(&b.id))
    }

    /// Order of a date list: bucket first, then [`rank_order`].
    pub fn index_order<C>(a: &Item<C>, b: &Item<C>) -> Ordering {
        a.bucket.cmp(&b.bucket).then_with(|| rank_order(a, b))
    }

    /// One past the highest rank in `bucket`, or 1 for an empty bucket.
    pub fn next_rank<'a, C: 'a>(
        items: impl IntoIterator<Item = &'a Item<C>>,
        bucket: PriorityBucket,
    ) -> u32 {
        items
            .into_iter()
            .filter(|item| item.is_live() && item.bucket == bucket)
            .map(|item| item.rank)
            .max()
            .map_or(1, |max| max.saturating_add(1))
    }

    /// Dense 1..N assignment for every live item in `bucket`, in rank order.
    pub fn renumber<'a, C: 'a>(
        items: impl IntoIterator<Item = &'a Item<C>>,
        bucket: PriorityBucket,
    ) -> Vec<RankChange> {
        let mut members: Vec<&Item<C>> = items
            .into_iter()
            .filter(|item| item.is_live() && item.bucket == bucket)
            .collect();
        members.sort_by(|a, b| rank_order(a, b));
        let assignment: Vec<RankChange> = members
            .iter()
            .zip(1u32..)
            .map(|(item, rank)| RankChange::new(item.id.clone(), rank))
            .collect();
        debug_assert!(is_dense(&assignment), "renumber produced {assignment:?}");
        assignment
    }

    /// The subset of `assignment` that differs from the items' current ranks.
    pub fn changed<'a, C: 'a>(
        items: impl IntoIterator<Item = &'a Item<C>>,
        assignment: &[RankChange],
    ) -> Vec<RankChange> {
        let current: HashMap<&ItemId, u32> =
            items.into_iter().map(|item| (&item.id, item.rank)).collect();
        assignment
            .iter()
            .filter(|change| current.get(&change.id) != Some(&change.rank))
            .cloned()
            .collect()
    }

    /// True when the ranks are exactly 1..=N with no repeats.
    pub fn is_dense(assignment: &[RankChange]) -> bool {
        let mut ranks: Vec<u32> = assignment.iter().map(|change| change.rank).collect();
        ranks.sort_unstable();
        ranks.into_iter().eq(1..=assignment.len() as u32)
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::core::{DateKey, OwnerId, TaskContent};
        use chrono::{DateTime, Utc};

        fn task(id: &str, bucket: PriorityBucket, rank: u32, at: i64) -> Item<TaskContent> {
            Item {
                id: ItemId::from(id),
                owner_id: OwnerId::from("me"),
                scheduled_date: DateKey::from_ymd(2025, 1, 2).unwrap(),
                bucket,
                rank,
                updated_at: DateTime::<Utc>::from_timestamp(at, 0).unwrap(),
                is_deleted: false,
                content: TaskContent::new(id),
            }
        }

        #[test]
        fn next_rank_starts_at_one_and_skips_past_gaps() {
            let empty: Vec<Item<TaskContent>> = vec![];
            assert_eq!(next_rank(&empty, PriorityBucket::A), 1);

            let items = vec![
                task("a", PriorityBucket::A, 1, 0),
                task("b", PriorityBucket::A, 5, 0),
                task("c", PriorityBucket::B, 9, 0),
            ];
            assert_eq!(next_rank(&items, PriorityBucket::A), 6);
            assert_eq!(next_rank(&items, PriorityBucket::C), 1);
        }

        #[test]
        fn next_rank_ignores_deleted_items() {
            let mut gone = task("gone", PriorityBucket::A, 7, 0);
            gone.is_deleted = true;
            let items = vec![task("a", PriorityBucket::A, 2, 0), gone];
            assert_eq!(next_rank(&items, PriorityBucket::A), 3);
        }

        #[test]
        fn renumber_closes_gaps_and_breaks_ties_deterministically() {
            let items = vec![
                task("late", PriorityBucket::A, 4, 20),
                task("zeta", PriorityBucket::A, 4, 10),
                task("alpha", PriorityBucket::A, 4, 10),
                task("first", PriorityBucket::A, 2, 99),
                task("other", PriorityBucket::B, 1, 0),
            ];
            let assignment = renumber(&items, PriorityBucket::A);
            assert_eq!(
                assignment,
                vec![
                    RankChange::new("first", 1),
                    RankChange::new("alpha", 2),
                    RankChange::new("zeta", 3),
                    RankChange::new("late", 4),
                ]
            );
            assert!(is_dense(&assignment));
        }

        #[test]
        fn changed_reports_only_moved_ranks() {
            let items = vec![
                task("a", PriorityBucket::A, 1, 0),
                task("b", PriorityBucket::A, 3, 0),
                task("c", PriorityBucket::A, 4, 0),
            ];
            let assignment = renumber(&items, PriorityBucket::A);
            assert_eq!(
                changed(&items, &assignment),
                vec![RankChange::new("b", 2), RankChange::new("c", 3)]
            );
        }

        #[test]
        fn density_check() {
            assert!(is_dense(&[]));
            assert!(is_dense(&[RankChange::new("a", 2), RankChange::new("b", 1)]));
            assert!(!is_dense(&[RankChange::new("a", 1), RankChange::new("b", 1)]));
            assert!(!is_dense(&[RankChange::new("a", 2)]));
        }
    }
}

pub mod reorder {
    //! Drag-to-reorder: turn one (source, target) gesture into the minimal set of rank
    //! changes for the source's bucket.

    use super::core::{Item, ItemId, PriorityBucket};
    use super::ordering::{self, RankChange};
    use serde::{Deserialize, Serialize};

    /// One row of a date listing as the reorder engine sees it.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct BucketEntry {
        pub id: ItemId,
        pub bucket: PriorityBucket,
        pub rank: u32,
    }

    impl BucketEntry {
        pub fn new(id: impl Into<ItemId>, bucket: PriorityBucket, rank: u32) -> Self {
            Self {
                id: id.into(),
                bucket,
                rank,
            }
        }
    }

    impl<C> From<&Item<C>> for BucketEntry {
        fn from(item: &Item<C>) -> Self {
            Self::new(item.id.clone(), item.bucket, item.rank)
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum ReorderOutcome {
        Moved,
        /// Self-drop, or a move that leaves every rank where it was.
        Unchanged,
        /// Source and target sit in different buckets; the gesture is ignored.
        CrossBucket,
        UnknownItem,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ReorderPlan {
        pub outcome: ReorderOutcome,
        /// The input listing with the source's bucket rearranged.
        pub order: Vec<ItemId>,
        /// Items whose rank differs from before, with their new rank.
        pub changes: Vec<RankChange>,
    }

    impl ReorderPlan {
        fn unchanged(entries: &[BucketEntry], outcome: ReorderOutcome) -> Self {
            Self {
                outcome,
                order: entries.iter().map(|entry| entry.id.clone()).collect(),
                changes: Vec::new(),
            }
        }

        pub fn is_noop(&self) -> bool {
            self.changes.is_empty()
        }
    }

    /// `entries` is one date's listing, rank-sorted within each bucket. The source takes
    /// the target's index and everything between them shifts one slot toward the
    /// source's old position; the bucket is then numbered 1..N in its new order.
    pub fn reorder(entries: &[BucketEntry], source: &ItemId, target: &ItemId) -> ReorderPlan {
        let find = |id: &ItemId| entries.iter().find(|entry| &entry.id == id);
        let (Some(from_entry), Some(to_entry)) = (find(source), find(target)) else {
            return ReorderPlan::unchanged(entries, ReorderOutcome::UnknownItem);
        };
        if from_entry.bucket != to_entry.bucket {
            return ReorderPlan::unchanged(entries, ReorderOutcome::CrossBucket);
        }
        if source == target {
            return ReorderPlan::unchanged(entries, ReorderOutcome::Unchanged);
        }

        let bucket = from_entry.bucket;
        let slots: Vec<usize> = entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.bucket == bucket)
            .map(|(slot, _)| slot)
            .collect();
        let mut members: Vec<&BucketEntry> = slots.iter().map(|&slot| &entries[slot]).collect();
        let (Some(from), Some(to)) = (
            members.iter().position(|entry| &entry.id == source),
            members.iter().position(|entry| &entry.id == target),
        ) else {
            return ReorderPlan::unchanged(entries, ReorderOutcome::UnknownItem);
        };

        let moved = members.remove(from);
        members.insert(to, moved);

        let changes: Vec<RankChange> = members
            .iter()
            .zip(1u32..)
            .filter(|(entry, rank)| entry.rank != *rank)
            .map(|(entry, rank)| RankChange::new(entry.id.clone(), rank))
            .collect();
        debug_assert!(
            ordering::is_dense(
                &members
                    .iter()
                    .zip(1u32..)
                    .map(|(entry, rank)| RankChange::new(entry.id.clone(), rank))
                    .collect::<Vec<_>>()
            ),
            "reorder must leave the bucket dense"
        );

        let mut order: Vec<ItemId> = entries.iter().map(|entry| entry.id.clone()).collect();
        for (slot, entry) in slots.iter().zip(&members) {
            order[*slot] = entry.id.clone();
        }
        let outcome = if changes.is_empty() {
            ReorderOutcome::Unchanged
        } else {
            ReorderOutcome::Moved
        };
        ReorderPlan {
            outcome,
            order,
            changes,
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn bucket(ids: &[&str]) -> Vec<BucketEntry> {
            ids.iter()
                .zip(1u32..)
                .map(|(id, rank)| BucketEntry::new(*id, PriorityBucket::A, rank))
                .collect()
        }

        fn order(plan: &ReorderPlan) -> Vec<&str> {
            plan.order.iter().map(ItemId::as_str).collect()
        }

        fn id(s: &str) -> ItemId {
            ItemId::from(s)
        }

        #[test]
        fn moving_first_onto_last_shifts_everything_up() {
            let plan = reorder(&bucket(&["1", "2", "3"]), &id("1"), &id("3"));
            assert_eq!(plan.outcome, ReorderOutcome::Moved);
            assert_eq!(order(&plan), ["2", "3", "1"]);
            // Every item's rank differs from before, so all three are reported.
            assert_eq!(
                plan.changes,
                vec![
                    RankChange::new("2", 1),
                    RankChange::new("3", 2),
                    RankChange::new("1", 3),
                ]
            );
        }

        #[test]
        fn moving_last_onto_first_is_the_same_insertion() {
            let plan = reorder(&bucket(&["1", "2", "3"]), &id("3"), &id("1"));
            assert_eq!(order(&plan), ["3", "1", "2"]);
            assert_eq!(plan.changes.len(), 3);
        }

        #[test]
        fn adjacent_swap_touches_exactly_two_items() {
            let plan = reorder(&bucket(&["1", "2", "3", "4"]), &id("2"), &id("3"));
            assert_eq!(order(&plan), ["1", "3", "2", "4"]);
            assert_eq!(
                plan.changes,
                vec![RankChange::new("3", 2), RankChange::new("2", 3)]
            );
        }

        #[test]
        fn self_drop_and_singleton_buckets_are_noops() {
            let plan = reorder(&bucket(&["1", "2"]), &id("2"), &id("2"));
            assert_eq!(plan.outcome, ReorderOutcome::Unchanged);
            assert!(plan.is_noop());

            let plan = reorder(&bucket(&["solo"]), &id("solo"), &id("solo"));
            assert!(plan.is_noop());
        }

        #[test]
        fn self_drop_does_not_renumber_a_gappy_bucket() {
            let entries = vec![
                BucketEntry::new("a", PriorityBucket::A, 2),
                BucketEntry::new("b", PriorityBucket::A, 9),
            ];
            assert!(reorder(&entries, &id("b"), &id("b")).is_noop());
        }

        #[test]
        fn cross_bucket_drop_is_ignored() {
            let mut entries = bucket(&["a1", "a2"]);
            entries.push(BucketEntry::new("b1", PriorityBucket::B, 1));
            entries.push(BucketEntry::new("b2", PriorityBucket::B, 2));

            let plan = reorder(&entries, &id("a1"), &id("b2"));
            assert_eq!(plan.outcome, ReorderOutcome::CrossBucket);
            assert_eq!(order(&plan), ["a1", "a2", "b1", "b2"]);
            assert!(plan.is_noop());
        }

        #[test]
        fn other_buckets_keep_their_slots() {
            let entries = vec![
                BucketEntry::new("a1", PriorityBucket::A, 1),
                BucketEntry::new("a2", PriorityBucket::A, 2),
                BucketEntry::new("b1", PriorityBucket::B, 1),
                BucketEntry::new("b2", PriorityBucket::B, 2),
                BucketEntry::new("b3", PriorityBucket::B, 3),
            ];
            let plan = reorder(&entries, &id("b3"), &id("b1"));
            assert_eq!(order(&plan), ["a1", "a2", "b3", "b1", "b2"]);
            assert!(plan.changes.iter().all(|change| change.id.as_str().starts_with('b')));
        }

        #[test]
        fn unknown_ids_leave_the_listing_alone() {
            let plan = reorder(&bucket(&["1", "2"]), &id("1"), &id("missing"));
            assert_eq!(plan.outcome, ReorderOutcome::UnknownItem);
            assert!(plan.is_noop());
        }

        #[test]
        fn adjacent_moves_round_trip() {
            let start = bucket(&["x", "y", "z"]);
            let there = reorder(&start, &id("x"), &id("y"));
            assert_eq!(order(&there), ["y", "x", "z"]);

            let moved = bucket(&["y", "x", "z"]);
            let back = reorder(&moved, &id("y"), &id("x"));
            assert_eq!(order(&back), ["x", "y", "z"]);
        }

        #[test]
        fn non_adjacent_moves_do_not_round_trip() {
            let start = bucket(&["x", "y", "z"]);
            let there = reorder(&start, &id("x"), &id("z"));
            assert_eq!(order(&there), ["y", "z", "x"]);

            // Dragging z back onto x's slot puts z last, not where it started.
            let moved = bucket(&["y", "z", "x"]);
            let back = reorder(&moved, &id("z"), &id("x"));
            assert_eq!(order(&back), ["y", "x", "z"]);
        }
    }
}

pub mod remote {
    //! Remote store boundary, plus two implementations that share one ledger: an
    //! in-memory store with failure injection, and a JSON file per collection.

    use super::core::{DateKey, Item, ItemContent, ItemId, ItemPatch, NewItem, OwnerId};
    use super::ordering;
    use chrono::Utc;
    use indexmap::IndexMap;
    use std::{
        cell::RefCell,
        collections::VecDeque,
        fs,
        marker::PhantomData,
        path::{Path, PathBuf},
    };

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum RemoteError {
        #[error("item {0} not found")]
        NotFound(ItemId),
        #[error("not authorized: {0}")]
        Unauthorized(String),
        #[error("network error: {0}")]
        Network(String),
        #[error("remote rejected the write: {0}")]
        Rejected(String),
        #[error("storage error: {0}")]
        Storage(String),
    }

    /// The persistence collaborator. Every call is scoped to one owner; ids that are
    /// missing or belong to someone else report `NotFound`.
    pub trait RemoteStore<C: ItemContent> {
        /// Live items for one owner and date.
        fn fetch_by_date(&self, owner: &OwnerId, date: DateKey) -> Result<Vec<Item<C>>, RemoteError>;

        /// One item by id, soft-deleted or not.
        fn fetch_one(&self, owner: &OwnerId, id: &ItemId) -> Result<Item<C>, RemoteError>;

        fn create(&self, item: NewItem<C>) -> Result<Item<C>, RemoteError>;

        fn update(&self, owner: &OwnerId, id: &ItemId, patch: &ItemPatch<C>) -> Result<(), RemoteError>;

        /// All-or-nothing: if any id is rejected, nothing is written.
        fn batch_update(
            &self,
            owner: &OwnerId,
            updates: &[(ItemId, ItemPatch<C>)],
        ) -> Result<(), RemoteError>;

        fn soft_delete(&self, owner: &OwnerId, id: &ItemId) -> Result<(), RemoteError>;

        fn hard_delete(&self, owner: &OwnerId, id: &ItemId) -> Result<(), RemoteError>;
    }

    /// A write the coordinator still owes the remote store.
    #[derive(Debug, Clone, PartialEq)]
    pub enum RemoteRequest<C> {
        Update { id: ItemId, patch: ItemPatch<C> },
        BatchUpdate(Vec<(ItemId, ItemPatch<C>)>),
        SoftDelete(ItemId),
        HardDelete(ItemId),
    }

    impl<C: ItemContent> RemoteRequest<C> {
        pub fn dispatch<R>(&self, remote: &R, owner: &OwnerId) -> Result<(), RemoteError>
        where
            R: RemoteStore<C> + ?Sized,
        {
            match self {
                Self::Update { id, patch } => remote.update(owner, id, patch),
                Self::BatchUpdate(updates) => remote.batch_update(owner, updates),
                Self::SoftDelete(id) => remote.soft_delete(owner, id),
                Self::HardDelete(id) => remote.hard_delete(owner, id),
            }
        }

        pub fn ids(&self) -> Vec<&ItemId> {
            match self {
                Self::Update { id, .. } | Self::SoftDelete(id) | Self::HardDelete(id) => vec![id],
                Self::BatchUpdate(updates) => updates.iter().map(|(id, _)| id).collect(),
            }
        }
    }

    /* -------------------------------- Ledger -------------------------------- */

    /// Authoritative item table behind both remotes.
    #[derive(Debug, Clone)]
    struct Ledger<C> {
        items: IndexMap<ItemId, Item<C>>,
    }

    impl<C> Default for Ledger<C> {
        fn default() -> Self {
            Self {
                items: IndexMap::new(),
            }
        }
    }

    impl<C: ItemContent> Ledger<C> {
        fn from_items(items: Vec<Item<C>>) -> Self {
            Self {
                items: items.into_iter().map(|item| (item.id.clone(), item)).collect(),
            }
        }

        fn owned(&self, owner: &OwnerId, id: &ItemId) -> Result<&Item<C>, RemoteError> {
            match self.items.get(id) {
                Some(item) if &item.owner_id == owner => Ok(item),
                _ => Err(RemoteError::NotFound(id.clone())),
            }
        }

        fn owned_mut(&mut self, owner: &OwnerId, id: &ItemId) -> Result<&mut Item<C>, RemoteError> {
            match self.items.get_mut(id) {
                Some(item) if &item.owner_id == owner => Ok(item),
                _ => Err(RemoteError::NotFound(id.clone())),
            }
        }

        fn fetch_by_date(&self, owner: &OwnerId, date: DateKey) -> Vec<Item<C>> {
            let mut items: Vec<Item<C>> = self
                .items
                .values()
                .filter(|item| &item.owner_id == owner && item.scheduled_date == date && item.is_live())
                .cloned()
                .collect();
            items.sort_by(ordering::index_order);
            items
        }

        fn create(&mut self, item: NewItem<C>) -> Item<C> {
            let stored = item.with_id(ItemId::generate());
            self.items.insert(stored.id.clone(), stored.clone());
            stored
        }

        fn update(&mut self, owner: &OwnerId, id: &ItemId, patch: &ItemPatch<C>) -> Result<(), RemoteError> {
            let item = self.owned_mut(owner, id)?;
            patch.apply(item);
            Ok(())
        }

        fn batch_update(&mut self, owner: &OwnerId, updates: &[(ItemId, ItemPatch<C>)]) -> Result<(), RemoteError> {
            for (id, _) in updates {
                self.owned(owner, id)?;
            }
            for (id, patch) in updates {
                self.update(owner, id, patch)?;
            }
            Ok(())
        }

        fn soft_delete(&mut self, owner: &OwnerId, id: &ItemId) -> Result<(), RemoteError> {
            let item = self.owned_mut(owner, id)?;
            item.is_deleted = true;
            item.updated_at = Utc::now();
            Ok(())
        }

        fn hard_delete(&mut self, owner: &OwnerId, id: &ItemId) -> Result<(), RemoteError> {
            self.owned(owner, id)?;
            self.items.shift_remove(id);
            Ok(())
        }
    }

    /* ----------------------------- MemoryRemote ----------------------------- */

    /// Record of one call made against a [`MemoryRemote`].
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum RemoteCall {
        FetchByDate(DateKey),
        FetchOne(ItemId),
        Create,
        Update(ItemId),
        BatchUpdate(Vec<ItemId>),
        SoftDelete(ItemId),
        HardDelete(ItemId),
    }

    struct MemoryState<C> {
        ledger: Ledger<C>,
        failures: VecDeque<RemoteError>,
        calls: Vec<RemoteCall>,
    }

    /// In-process remote. Queued failures are returned, in order, by the next calls.
    pub struct MemoryRemote<C> {
        state: RefCell<MemoryState<C>>,
    }

    impl<C> Default for MemoryRemote<C> {
        fn default() -> Self {
            Self {
                state: RefCell::new(MemoryState {
                    ledger: Ledger::default(),
                    failures: VecDeque::new(),
                    calls: Vec::new(),
                }),
            }
        }
    }

    impl<C: ItemContent> MemoryRemote<C> {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn fail_next(&self, error: RemoteError) {
            self.state.borrow_mut().failures.push_back(error);
        }

        pub fn calls(&self) -> Vec<RemoteCall> {
            self.state.borrow().calls.clone()
        }

        pub fn item(&self, id: &ItemId) -> Option<Item<C>> {
            self.state.borrow().ledger.items.get(id).cloned()
        }

        /// Place an item directly in the ledger, bypassing call logging.
        pub fn seed(&self, item: Item<C>) {
            self.state
                .borrow_mut()
                .ledger
                .items
                .insert(item.id.clone(), item);
        }

        pub fn len(&self) -> usize {
            self.state.borrow().ledger.items.len()
        }

        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }

        fn call<T>(
            &self,
            call: RemoteCall,
            op: impl FnOnce(&mut Ledger<C>) -> Result<T, RemoteError>,
        ) -> Result<T, RemoteError> {
            let mut state = self.state.borrow_mut();
            state.calls.push(call);
            if let Some(error) = state.failures.pop_front() {
                return Err(error);
            }
            op(&mut state.ledger)
        }
    }

    impl<C: ItemContent> RemoteStore<C> for MemoryRemote<C> {
        fn fetch_by_date(&self, owner: &OwnerId, date: DateKey) -> Result<Vec<Item<C>>, RemoteError> {
            self.call(RemoteCall::FetchByDate(date), |ledger| {
                Ok(ledger.fetch_by_date(owner, date))
            })
        }

        fn fetch_one(&self, owner: &OwnerId, id: &ItemId) -> Result<Item<C>, RemoteError> {
            self.call(RemoteCall::FetchOne(id.clone()), |ledger| {
                ledger.owned(owner, id).cloned()
            })
        }

        fn create(&self, item: NewItem<C>) -> Result<Item<C>, RemoteError> {
            self.call(RemoteCall::Create, |ledger| Ok(ledger.create(item)))
        }

        fn update(&self, owner: &OwnerId, id: &ItemId, patch: &ItemPatch<C>) -> Result<(), RemoteError> {
            self.call(RemoteCall::Update(id.clone()), |ledger| {
                ledger.update(owner, id, patch)
            })
        }

        fn batch_update(
            &self,
            owner: &OwnerId,
            updates: &[(ItemId, ItemPatch<C>)],
        ) -> Result<(), RemoteError> {
            let ids = updates.iter().map(|(id, _)| id.clone()).collect();
            self.call(RemoteCall::BatchUpdate(ids), |ledger| {
                ledger.batch_update(owner, updates)
            })
        }

        fn soft_delete(&self, owner: &OwnerId, id: &ItemId) -> Result<(), RemoteError> {
            self.call(RemoteCall::SoftDelete(id.clone()), |ledger| {
                ledger.soft_delete(owner, id)
            })
        }

        fn hard_delete(&self, owner: &OwnerId, id: &ItemId) -> Result<(), RemoteError> {
            self.call(RemoteCall::HardDelete(id.clone()), |ledger| {
                ledger.hard_delete(owner, id)
            })
        }
    }

    /* ---------------------------- JsonFileRemote ---------------------------- */

    /// Remote backed by a pretty-printed JSON array of items. Every call reads the file,
    /// and writes go back before the call returns.
    #[derive(Debug, Clone)]
    pub struct JsonFileRemote<C> {
        path: PathBuf,
        _content: PhantomData<C>,
    }

    impl<C: ItemContent> JsonFileRemote<C> {
        pub fn new(path: impl Into<PathBuf>) -> Self {
            Self {
                path: path.into(),
                _content: PhantomData,
            }
        }

        /// `<dir>/<collection>.json`, e.g. `tasks.json`.
        pub fn in_dir(dir: &Path) -> Self {
            Self::new(dir.join(format!("{}.json", C::KIND.as_str())))
        }

        pub fn path(&self) -> &Path {
            &self.path
        }

        fn load(&self) -> Result<Ledger<C>, RemoteError> {
            if !self.path.exists() {
                return Ok(Ledger::default());
            }
            let text = fs::read_to_string(&self.path).map_err(|e| {
                RemoteError::Storage(format!("reading {}: {e}", self.path.display()))
            })?;
            let items: Vec<Item<C>> = serde_json::from_str(&text).map_err(|e| {
                RemoteError::Storage(format!("parsing {}: {e}", self.path.display()))
            })?;
            Ok(Ledger::from_items(items))
        }

        fn save(&self, ledger: &Ledger<C>) -> Result<(), RemoteError> {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent).map_err(|e| {
                    RemoteError::Storage(format!("creating {}: {e}", parent.display()))
                })?;
            }
            let items: Vec<&Item<C>> = ledger.items.values().collect();
            let json = serde_json::to_string_pretty(&items)
                .map_err(|e| RemoteError::Storage(format!("encoding items: {e}")))?;
            fs::write(&self.path, json).map_err(|e| {
                RemoteError::Storage(format!("writing {}: {e}", self.path.display()))
            })
        }

        fn read<T>(&self, op: impl FnOnce(&Ledger<C>) -> Result<T, RemoteError>) -> Result<T, RemoteError> {
            let ledger = self.load()?;
            op(&ledger)
        }

        fn write<T>(
            &self,
            op: impl FnOnce(&mut Ledger<C>) -> Result<T, RemoteError>,
        ) -> Result<T, RemoteError> {
            let mut ledger = self.load()?;
            let out = op(&mut ledger)?;
            self.save(&ledger)?;
            Ok(out)
        }
    }

    impl<C: ItemContent> RemoteStore<C> for JsonFileRemote<C> {
        fn fetch_by_date(&self, owner: &OwnerId, date: DateKey) -> Result<Vec<Item<C>>, RemoteError> {
            self.read(|ledger| Ok(ledger.fetch_by_date(owner, date)))
        }

        fn fetch_one(&self, owner: &OwnerId, id: &ItemId) -> Result<Item<C>, RemoteError> {
            self.read(|ledger| ledger.owned(owner, id).cloned())
        }

        fn create(&self, item: NewItem<C>) -> Result<Item<C>, RemoteError> {
            self.write(|ledger| Ok(ledger.create(item)))
        }

        fn update(&self, owner: &OwnerId, id: &ItemId, patch: &ItemPatch<C>) -> Result<(), RemoteError> {
            self.write(|ledger| ledger.update(owner, id, patch))
        }

        fn batch_update(
            &self,
            owner: &OwnerId,
            updates: &[(ItemId, ItemPatch<C>)],
        ) -> Result<(), RemoteError> {
            self.write(|ledger| ledger.batch_update(owner, updates))
        }

        fn soft_delete(&self, owner: &OwnerId, id: &ItemId) -> Result<(), RemoteError> {
            self.write(|ledger| ledger.soft_delete(owner, id))
        }

        fn hard_delete(&self, owner: &OwnerId, id: &ItemId) -> Result<(), RemoteError> {
            self.write(|ledger| ledger.hard_delete(owner, id))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::core::{PriorityBucket, TaskContent};

        fn owner() -> OwnerId {
            OwnerId::from("me")
        }

        fn day() -> DateKey {
            DateKey::from_ymd(2025, 4, 1).unwrap()
        }

        fn new_task(title: &str, rank: u32) -> NewItem<TaskContent> {
            NewItem {
                owner_id: owner(),
                scheduled_date: day(),
                bucket: PriorityBucket::A,
                rank,
                updated_at: Utc::now(),
                content: TaskContent::new(title),
            }
        }

        #[test]
        fn batch_update_writes_nothing_when_one_id_is_unknown() {
            let remote = MemoryRemote::new();
            let a = remote.create(new_task("a", 1)).unwrap();
            let patch = ItemPatch {
                rank: Some(2),
                ..ItemPatch::touch(Utc::now())
            };

            let err = remote
                .batch_update(
                    &owner(),
                    &[
                        (a.id.clone(), patch.clone()),
                        (ItemId::from("ghost"), patch),
                    ],
                )
                .unwrap_err();

            assert_eq!(err, RemoteError::NotFound(ItemId::from("ghost")));
            assert_eq!(remote.item(&a.id).unwrap().rank, 1);
        }

        #[test]
        fn other_owners_see_not_found() {
            let remote = MemoryRemote::new();
            let a = remote.create(new_task("a", 1)).unwrap();
            let stranger = OwnerId::from("stranger");
            assert_eq!(
                remote.soft_delete(&stranger, &a.id),
                Err(RemoteError::NotFound(a.id.clone()))
            );
            assert!(remote.fetch_by_date(&stranger, day()).unwrap().is_empty());
        }

        #[test]
        fn queued_failures_fire_in_order_and_are_logged() {
            let remote: MemoryRemote<TaskContent> = MemoryRemote::new();
            remote.fail_next(RemoteError::Network("offline".into()));

            assert_eq!(
                remote.fetch_by_date(&owner(), day()),
                Err(RemoteError::Network("offline".into()))
            );
            assert!(remote.fetch_by_date(&owner(), day()).is_ok());
            assert_eq!(
                remote.calls(),
                vec![RemoteCall::FetchByDate(day()), RemoteCall::FetchByDate(day())]
            );
        }

        #[test]
        fn fetch_by_date_skips_soft_deleted_items() {
            let remote = MemoryRemote::new();
            let a = remote.create(new_task("a", 1)).unwrap();
            let b = remote.create(new_task("b", 2)).unwrap();
            remote.soft_delete(&owner(), &a.id).unwrap();

            let live = remote.fetch_by_date(&owner(), day()).unwrap();
            assert_eq!(live.len(), 1);
            assert_eq!(live[0].id, b.id);
            assert!(remote.fetch_one(&owner(), &a.id).unwrap().is_deleted);
        }

        #[test]
        fn json_file_remote_persists_between_instances() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let first = JsonFileRemote::<TaskContent>::in_dir(tmp.path());
            assert!(first.path().ends_with("tasks.json"));
            let created = first.create(new_task("persisted", 1)).unwrap();

            let second = JsonFileRemote::<TaskContent>::in_dir(tmp.path());
            let fetched = second.fetch_by_date(&owner(), day()).unwrap();
            assert_eq!(fetched, vec![created.clone()]);

            second.hard_delete(&owner(), &created.id).unwrap();
            assert!(first.fetch_by_date(&owner(), day()).unwrap().is_empty());
        }

        #[test]
        fn json_file_remote_reports_corrupt_files() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = tmp.path().join("tasks.json");
            fs::write(&path, "not json").expect("write");

            let remote = JsonFileRemote::<TaskContent>::new(&path);
            assert!(matches!(
                remote.fetch_by_date(&owner(), day()),
                Err(RemoteError::Storage(_))
            ));
        }
    }
}

pub mod sync {
    //! Synchronization coordinator: one generic engine per collection.
    //!
    //! Every mutating command snapshots the items it touches, writes its optimistic
    //! images into the store, and hands back a [`PendingOp`] carrying the remote write.
    //! [`Collection::settle`] commits or rolls back once the remote has answered. The
    //! one-shot commands (`reorder_item` etc.) do all three steps in one call.
    //!
    //! Overlapping operations settle last-writer-wins by issue order. Each item
    //! remembers the last in-flight operation that wrote it; a failing operation
    //! restores only items it still owns and subtracts its own field changes from every
    //! later image of the rest.

    use super::core::{
        CollectionKind, DateKey, GroupKey, Item, ItemContent, ItemDraft, ItemId, ItemPatch, NewItem,
        OwnerId, PriorityBucket, ValidationError,
    };
    use super::ordering::{self, RankChange};
    use super::remote::{RemoteError, RemoteRequest, RemoteStore};
    use super::reorder::{self, BucketEntry, ReorderOutcome};
    use super::store::{CollectionStore, Snapshot};
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};
    use std::collections::{BTreeMap, BTreeSet, HashMap};
    use std::fmt;
    use tracing::{debug, info, warn};

    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum SyncStatus {
        #[default]
        Synced,
        Syncing,
        Error,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum OpKind {
        Fetch,
        Create,
        Update,
        MoveDate,
        ChangeBucket,
        Reorder,
        Delete,
        Restore,
        Purge,
        Renumber,
        /// Follow-up renumber issued after a rollback left duplicate ranks.
        Repair,
    }

    impl OpKind {
        pub fn as_str(self) -> &'static str {
            match self {
                Self::Fetch => "fetch",
                Self::Create => "create",
                Self::Update => "update",
                Self::MoveDate => "move_date",
                Self::ChangeBucket => "change_bucket",
                Self::Reorder => "reorder",
                Self::Delete => "delete",
                Self::Restore => "restore",
                Self::Purge => "purge",
                Self::Renumber => "renumber",
                Self::Repair => "repair",
            }
        }
    }

    impl fmt::Display for OpKind {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum CommandError {
        #[error(transparent)]
        Validation(#[from] ValidationError),
        #[error("no item {0} in this collection")]
        UnknownItem(ItemId),
        #[error("item {0} is deleted")]
        Deleted(ItemId),
        #[error("item {0} is not deleted")]
        NotDeleted(ItemId),
        #[error(transparent)]
        Remote(#[from] RemoteError),
    }

    /// An optimistic write already applied locally, waiting for the remote outcome.
    #[must_use = "a pending operation must be settled"]
    #[derive(Debug)]
    pub struct PendingOp<C> {
        seq: u64,
        kind: OpKind,
        request: RemoteRequest<C>,
    }

    impl<C: ItemContent> PendingOp<C> {
        pub fn seq(&self) -> u64 {
            self.seq
        }

        pub fn kind(&self) -> OpKind {
            self.kind
        }

        pub fn request(&self) -> &RemoteRequest<C> {
            &self.request
        }

        pub fn dispatch<R>(&self, remote: &R, owner: &OwnerId) -> Result<(), RemoteError>
        where
            R: RemoteStore<C> + ?Sized,
        {
            self.request.dispatch(remote, owner)
        }
    }

    /// What settling one operation did to the store.
    #[derive(Debug)]
    #[must_use = "repairs are applied locally and must be dispatched and settled"]
    pub struct Settlement<C> {
        pub seq: u64,
        pub committed: bool,
        /// Items written back to their pre-operation image.
        pub restored: Vec<ItemId>,
        /// Items a later operation had rewritten; only this operation's own changes
        /// were taken back out.
        pub superseded: Vec<ItemId>,
        /// Groups left with duplicate ranks by the rollback.
        pub conflicts: Vec<GroupKey>,
        /// Renumbers already applied locally for each conflict; dispatch and settle them.
        pub repairs: Vec<PendingOp<C>>,
    }

    impl<C> Settlement<C> {
        fn new(seq: u64, committed: bool) -> Self {
            Self {
                seq,
                committed,
                restored: Vec::new(),
                superseded: Vec::new(),
                conflicts: Vec::new(),
                repairs: Vec::new(),
            }
        }
    }

    #[derive(Debug)]
    struct InFlight<C> {
        kind: OpKind,
        snapshot: Snapshot<C>,
        written: Vec<(ItemId, Option<Item<C>>)>,
    }

    impl<C: ItemContent> InFlight<C> {
        /// Take a failed earlier operation's changes (`before` -> `after`) out of this
        /// operation's images of `id`.
        fn rebase(&mut self, id: &ItemId, before: &Item<C>, after: &Item<C>) {
            if let Some(Some(mut image)) = self.snapshot.image(id).cloned() {
                subtract(&mut image, before, after);
                self.snapshot.replace(id, Some(image));
            }
            for (written, image) in &mut self.written {
                if *written == *id {
                    if let Some(image) = image {
                        subtract(image, before, after);
                    }
                }
            }
        }
    }

    /// Undo every field `before -> after` changed, unless `image` has since moved on.
    fn subtract<C: ItemContent>(image: &mut Item<C>, before: &Item<C>, after: &Item<C>) {
        if before.scheduled_date != after.scheduled_date && image.scheduled_date == after.scheduled_date {
            image.scheduled_date = before.scheduled_date;
        }
        if before.bucket != after.bucket && image.bucket == after.bucket {
            image.bucket = before.bucket;
        }
        if before.rank != after.rank && image.rank == after.rank {
            image.rank = before.rank;
        }
        if before.is_deleted != after.is_deleted && image.is_deleted == after.is_deleted {
            image.is_deleted = before.is_deleted;
        }
        if before.content != after.content && image.content == after.content {
            image.content = before.content.clone();
        }
    }

    /* ------------------------------ Coordinator ------------------------------ */

    pub struct Collection<C, R> {
        store: CollectionStore<C>,
        remote: R,
        status: SyncStatus,
        last_error: Option<String>,
        next_seq: u64,
        in_flight: BTreeMap<u64, InFlight<C>>,
        /// Last in-flight operation that wrote each item.
        writers: HashMap<ItemId, u64>,
    }

    impl<C: ItemContent, R: RemoteStore<C>> Collection<C, R> {
        pub fn new(owner: OwnerId, remote: R) -> Self {
            Self {
                store: CollectionStore::new(owner),
                remote,
                status: SyncStatus::Synced,
                last_error: None,
                next_seq: 1,
                in_flight: BTreeMap::new(),
                writers: HashMap::new(),
            }
        }

        pub fn kind(&self) -> CollectionKind {
            C::KIND
        }

        pub fn owner(&self) -> &OwnerId {
            self.store.owner()
        }

        pub fn store(&self) -> &CollectionStore<C> {
            &self.store
        }

        pub fn remote(&self) -> &R {
            &self.remote
        }

        pub fn status(&self) -> SyncStatus {
            self.status
        }

        pub fn last_error(&self) -> Option<&str> {
            self.last_error.as_deref()
        }

        pub fn get(&self, id: &ItemId) -> Option<&Item<C>> {
            self.store.get(id)
        }

        /// Number of operations dispatched but not yet settled.
        pub fn in_flight(&self) -> usize {
            self.in_flight.len()
        }

        /* ------------------------------- Reads ------------------------------- */

        /// Replace the local listing for `date` with the remote one. Items an unsettled
        /// operation is still writing keep their local image. Returns how many items
        /// are listed on `date` afterwards.
        pub fn fetch_date(&mut self, date: DateKey) -> Result<usize, CommandError> {
            self.mark_started(OpKind::Fetch);
            let fetched = match self.remote.fetch_by_date(self.store.owner(), date) {
                Ok(items) => items,
                Err(error) => {
                    self.mark_failed(OpKind::Fetch, &error);
                    return Err(error.into());
                }
            };
            let mut items: Vec<Item<C>> = fetched
                .into_iter()
                .filter(|item| !self.writers.contains_key(&item.id))
                .collect();
            for id in self.writers.keys() {
                if let Some(local) = self.store.get(id) {
                    if local.is_live() && local.scheduled_date == date {
                        items.push(local.clone());
                    }
                }
            }
            let upserted = self.store.upsert_many(date, items);
            self.accept(OpKind::Fetch, upserted)?;
            self.mark_succeeded(OpKind::Fetch);
            Ok(self.store.ids_on(date).len())
        }

        /// Load one item by id, deleted or not, unless an unsettled operation owns it.
        pub fn load_item(&mut self, id: &ItemId) -> Result<(), CommandError> {
            if self.writers.contains_key(id) {
                return Ok(());
            }
            self.mark_started(OpKind::Fetch);
            match self.remote.fetch_one(self.store.owner(), id) {
                Ok(item) => {
                    let upserted = self.store.upsert_one(item);
                    self.accept(OpKind::Fetch, upserted)?;
                    self.mark_succeeded(OpKind::Fetch);
                    Ok(())
                }
                Err(RemoteError::NotFound(missing)) => {
                    self.mark_succeeded(OpKind::Fetch);
                    Err(CommandError::UnknownItem(missing))
                }
                Err(error) => {
                    self.mark_failed(OpKind::Fetch, &error);
                    Err(error.into())
                }
            }
        }

        /* ------------------------------ Commands ------------------------------ */

        /// Create an item. The remote assigns the id, so nothing is inserted locally
        /// until it answers. A draft without a rank goes to the end of its bucket.
        pub fn create_item(&mut self, draft: ItemDraft<C>) -> Result<ItemId, CommandError> {
            let new_item = self.validate_draft(draft)?;
            self.mark_started(OpKind::Create);
            match self.remote.create(new_item) {
                Ok(item) => {
                    let id = item.id.clone();
                    let upserted = self.store.upsert_one(item);
                    self.accept(OpKind::Create, upserted)?;
                    self.mark_succeeded(OpKind::Create);
                    info!(collection = %C::KIND, %id, "created item");
                    Ok(id)
                }
                Err(error) => {
                    self.mark_failed(OpKind::Create, &error);
                    Err(error.into())
                }
            }
        }

        pub fn update_item(&mut self, id: &ItemId, content: C) -> Result<(), CommandError> {
            let op = self.begin_update(id, content)?;
            self.run_opt(op)
        }

        pub fn move_item_date(&mut self, id: &ItemId, date: DateKey) -> Result<(), CommandError> {
            let op = self.begin_move_date(id, date)?;
            self.run_opt(op)
        }

        pub fn change_bucket(&mut self, id: &ItemId, bucket: PriorityBucket) -> Result<(), CommandError> {
            let op = self.begin_change_bucket(id, bucket)?;
            self.run_opt(op)
        }

        /// Drag `source` onto `target`. Cross-bucket drops are ignored.
        pub fn reorder_item(
            &mut self,
            source: &ItemId,
            target: &ItemId,
        ) -> Result<ReorderOutcome, CommandError> {
            let (outcome, op) = self.begin_reorder(source, target)?;
            self.run_opt(op)?;
            Ok(outcome)
        }

        pub fn delete_item(&mut self, id: &ItemId) -> Result<(), CommandError> {
            let op = self.begin_delete(id)?;
            self.run(op)
        }

        pub fn restore_item(&mut self, id: &ItemId) -> Result<(), CommandError> {
            let op = self.begin_restore(id)?;
            self.run(op)
        }

        pub fn purge_item(&mut self, id: &ItemId) -> Result<(), CommandError> {
            let op = self.begin_purge(id)?;
            self.run(op)
        }

        /// Compact one bucket to 1..N. Returns how many ranks changed.
        pub fn renumber_bucket(
            &mut self,
            date: DateKey,
            bucket: PriorityBucket,
        ) -> Result<usize, CommandError> {
            let Some(op) = self.renumber_op(GroupKey::new(date, bucket), OpKind::Renumber) else {
                return Ok(0);
            };
            let changed = op.request().ids().len();
            self.run(op)?;
            Ok(changed)
        }

        pub fn dismiss_error(&mut self) {
            self.last_error = None;
            if self.status == SyncStatus::Error {
                self.status = if self.in_flight.is_empty() {
                    SyncStatus::Synced
                } else {
                    SyncStatus::Syncing
                };
            }
        }

        /* --------------------------- Two-phase entry --------------------------- */

        /// `None` when the content is unchanged.
        pub fn begin_update(&mut self, id: &ItemId, content: C) -> Result<Option<PendingOp<C>>, CommandError> {
            content.validate()?;
            let item = self.live(id)?;
            if item.content == content {
                return Ok(None);
            }
            let mut image = item.clone();
            image.content = content;
            image.updated_at = Utc::now();
            Ok(Some(self.stage_updates(OpKind::Update, vec![image], false)))
        }

        /// The item lands at the end of its bucket on the new date.
        pub fn begin_move_date(&mut self, id: &ItemId, date: DateKey) -> Result<Option<PendingOp<C>>, CommandError> {
            let item = self.live(id)?;
            if item.scheduled_date == date {
                return Ok(None);
            }
            let mut image = item.clone();
            image.scheduled_date = date;
            image.rank = ordering::next_rank(self.store.items_on(date), image.bucket);
            image.updated_at = Utc::now();
            Ok(Some(self.stage_updates(OpKind::MoveDate, vec![image], false)))
        }

        /// The item lands at the end of the new bucket on the same date.
        pub fn begin_change_bucket(
            &mut self,
            id: &ItemId,
            bucket: PriorityBucket,
        ) -> Result<Option<PendingOp<C>>, CommandError> {
            let item = self.live(id)?;
            if item.bucket == bucket {
                return Ok(None);
            }
            let mut image = item.clone();
            image.bucket = bucket;
            image.rank = ordering::next_rank(self.store.items_on(image.scheduled_date), bucket);
            image.updated_at = Utc::now();
            Ok(Some(self.stage_updates(OpKind::ChangeBucket, vec![image], false)))
        }

        pub fn begin_reorder(
            &mut self,
            source: &ItemId,
            target: &ItemId,
        ) -> Result<(ReorderOutcome, Option<PendingOp<C>>), CommandError> {
            let date = self.live(source)?.scheduled_date;
            self.live(target)?;
            let entries: Vec<BucketEntry> = self.store.items_on(date).map(BucketEntry::from).collect();
            let plan = reorder::reorder(&entries, source, target);
            match plan.outcome {
                ReorderOutcome::UnknownItem => return Err(CommandError::UnknownItem(target.clone())),
                ReorderOutcome::CrossBucket => {
                    debug!(collection = %C::KIND, %source, %target, "ignored cross-bucket drop");
                    return Ok((plan.outcome, None));
                }
                ReorderOutcome::Unchanged | ReorderOutcome::Moved => {}
            }
            if plan.is_noop() {
                return Ok((ReorderOutcome::Unchanged, None));
            }
            let images = self.ranked_images(&plan.changes, Utc::now());
            Ok((plan.outcome, Some(self.stage_updates(OpKind::Reorder, images, true))))
        }

        pub fn begin_delete(&mut self, id: &ItemId) -> Result<PendingOp<C>, CommandError> {
            let mut image = self.live(id)?.clone();
            image.is_deleted = true;
            image.updated_at = Utc::now();
            let request = RemoteRequest::SoftDelete(id.clone());
            Ok(self.stage(OpKind::Delete, request, vec![(id.clone(), Some(image))]))
        }

        /// Re-list a soft-deleted item, at the end of its bucket if its rank is taken.
        pub fn begin_restore(&mut self, id: &ItemId) -> Result<PendingOp<C>, CommandError> {
            let mut image = self.deleted(id)?.clone();
            let taken = self
                .store
                .group_items(image.group())
                .iter()
                .any(|item| item.rank == image.rank);
            if taken {
                image.rank = ordering::next_rank(self.store.items_on(image.scheduled_date), image.bucket);
            }
            image.is_deleted = false;
            image.updated_at = Utc::now();
            Ok(self.stage_updates(OpKind::Restore, vec![image], false))
        }

        /// Hard delete. Only soft-deleted items can be purged.
        pub fn begin_purge(&mut self, id: &ItemId) -> Result<PendingOp<C>, CommandError> {
            self.deleted(id)?;
            let request = RemoteRequest::HardDelete(id.clone());
            Ok(self.stage(OpKind::Purge, request, vec![(id.clone(), None)]))
        }

        pub fn begin_renumber(&mut self, date: DateKey, bucket: PriorityBucket) -> Option<PendingOp<C>> {
            self.renumber_op(GroupKey::new(date, bucket), OpKind::Renumber)
        }

        /// Commit or roll back `op` with the remote's answer.
        pub fn settle(&mut self, op: PendingOp<C>, result: Result<(), RemoteError>) -> Settlement<C> {
            let Some(flight) = self.in_flight.remove(&op.seq) else {
                warn!(collection = %C::KIND, seq = op.seq, "settled an operation that is not in flight");
                return Settlement::new(op.seq, false);
            };
            match result {
                Ok(()) => {
                    for (id, _) in &flight.written {
                        if self.writers.get(id) == Some(&op.seq) {
                            self.writers.remove(id);
                        }
                    }
                    self.mark_succeeded(flight.kind);
                    Settlement::new(op.seq, true)
                }
                Err(error) => {
                    self.mark_failed(flight.kind, &error);
                    self.roll_back(op.seq, flight)
                }
            }
        }

        /* ------------------------------- Views ------------------------------- */

        pub fn view(&self) -> CollectionView<'_, C> {
            let days = self
                .store
                .ids_by_date()
                .keys()
                .map(|&date| self.day_view(date))
                .collect();
            CollectionView {
                kind: C::KIND,
                sync_status: self.status,
                last_error: self.last_error.as_deref(),
                days,
            }
        }

        pub fn day_view(&self, date: DateKey) -> DayView<'_, C> {
            let buckets = PriorityBucket::ALL
                .into_iter()
                .map(|bucket| BucketView {
                    bucket,
                    items: self.store.group_items(GroupKey::new(date, bucket)),
                })
                .filter(|view| !view.items.is_empty())
                .collect();
            DayView { date, buckets }
        }

        /* ------------------------------ Internals ------------------------------ */

        fn validate_draft(&self, draft: ItemDraft<C>) -> Result<NewItem<C>, ValidationError> {
            let date = draft.scheduled_date.ok_or(ValidationError::MissingDate)?;
            draft.content.validate()?;
            let group = GroupKey::new(date, draft.bucket);
            let rank = match draft.rank {
                Some(0) => return Err(ValidationError::ZeroRank),
                Some(rank) => {
                    if self.store.group_items(group).iter().any(|item| item.rank == rank) {
                        return Err(ValidationError::RankTaken { group, rank });
                    }
                    rank
                }
                None => ordering::next_rank(self.store.items_on(date), draft.bucket),
            };
            Ok(NewItem {
                owner_id: self.store.owner().clone(),
                scheduled_date: date,
                bucket: draft.bucket,
                rank,
                updated_at: Utc::now(),
                content: draft.content,
            })
        }

        fn live(&self, id: &ItemId) -> Result<&Item<C>, CommandError> {
            match self.store.get(id) {
                None => Err(CommandError::UnknownItem(id.clone())),
                Some(item) if item.is_deleted => Err(CommandError::Deleted(id.clone())),
                Some(item) => Ok(item),
            }
        }

        fn deleted(&self, id: &ItemId) -> Result<&Item<C>, CommandError> {
            match self.store.get(id) {
                None => Err(CommandError::UnknownItem(id.clone())),
                Some(item) if item.is_live() => Err(CommandError::NotDeleted(id.clone())),
                Some(item) => Ok(item),
            }
        }

        fn ranked_images(&self, changes: &[RankChange], at: DateTime<Utc>) -> Vec<Item<C>> {
            changes
                .iter()
                .filter_map(|change| {
                    self.store.get(&change.id).map(|item| {
                        let mut image = item.clone();
                        image.rank = change.rank;
                        image.updated_at = at;
                        image
                    })
                })
                .collect()
        }

        fn renumber_op(&mut self, group: GroupKey, kind: OpKind) -> Option<PendingOp<C>> {
            let changes = {
                let items = self.store.group_items(group);
                let assignment = ordering::renumber(items.iter().copied(), group.bucket);
                ordering::changed(items.iter().copied(), &assignment)
            };
            if changes.is_empty() {
                return None;
            }
            let images = self.ranked_images(&changes, Utc::now());
            Some(self.stage_updates(kind, images, true))
        }

        /// Stage field updates, patching each image against the store's current one.
        fn stage_updates(&mut self, kind: OpKind, images: Vec<Item<C>>, batch: bool) -> PendingOp<C> {
            let mut patches: Vec<(ItemId, ItemPatch<C>)> = images
                .iter()
                .filter_map(|after| {
                    self.store
                        .get(&after.id)
                        .map(|before| (after.id.clone(), ItemPatch::between(before, after)))
                })
                .collect();
            let request = if !batch && patches.len() == 1 {
                let (id, patch) = patches.remove(0);
                RemoteRequest::Update { id, patch }
            } else {
                RemoteRequest::BatchUpdate(patches)
            };
            let written = images
                .into_iter()
                .map(|image| (image.id.clone(), Some(image)))
                .collect();
            self.stage(kind, request, written)
        }

        fn stage(
            &mut self,
            kind: OpKind,
            request: RemoteRequest<C>,
            written: Vec<(ItemId, Option<Item<C>>)>,
        ) -> PendingOp<C> {
            let seq = self.next_seq;
            self.next_seq += 1;
            let snapshot = self.store.snapshot(written.iter().map(|(id, _)| id));
            for (id, image) in &written {
                self.store.write_image(id, image.clone());
                self.writers.insert(id.clone(), seq);
            }
            self.debug_verify();
            self.in_flight.insert(
                seq,
                InFlight {
                    kind,
                    snapshot,
                    written,
                },
            );
            if kind != OpKind::Repair {
                self.mark_started(kind);
            }
            debug!(collection = %C::KIND, seq, op = %kind, "applied optimistic write");
            PendingOp { seq, kind, request }
        }

        fn run(&mut self, op: PendingOp<C>) -> Result<(), CommandError> {
            let outcome = op.dispatch(&self.remote, self.store.owner());
            let settlement = self.settle(op, outcome.clone());
            let mut repairs = settlement.repairs;
            while let Some(repair) = repairs.pop() {
                let result = repair.dispatch(&self.remote, self.store.owner());
                repairs.extend(self.settle(repair, result).repairs);
            }
            outcome.map_err(CommandError::from)
        }

        fn run_opt(&mut self, op: Option<PendingOp<C>>) -> Result<(), CommandError> {
            match op {
                Some(op) => self.run(op),
                None => Ok(()),
            }
        }

        fn roll_back(&mut self, seq: u64, flight: InFlight<C>) -> Settlement<C> {
            let InFlight {
                kind,
                snapshot,
                written,
            } = flight;
            let mut settlement = Settlement::new(seq, false);
            let mut groups = BTreeSet::new();
            for (id, after) in written {
                let before = snapshot.image(&id).cloned().flatten();
                let current = self.store.get(&id).cloned();
                groups.extend(
                    [&before, &current]
                        .into_iter()
                        .flatten()
                        .filter(|item| item.is_live())
                        .map(Item::group),
                );
                if self.writers.get(&id) == Some(&seq) {
                    self.writers.remove(&id);
                    self.store.write_image(&id, before);
                    settlement.restored.push(id);
                    continue;
                }
                let (Some(before), Some(after), Some(mut current)) = (before, after, current) else {
                    continue;
                };
                subtract(&mut current, &before, &after);
                // A partial revert can land the item in a group neither image was in.
                if current.is_live() {
                    groups.insert(current.group());
                }
                self.store.write_image(&id, Some(current));
                for later in self.in_flight.range_mut(seq + 1..).map(|(_, later)| later) {
                    later.rebase(&id, &before, &after);
                }
                settlement.superseded.push(id);
            }
            self.debug_verify();

            settlement.conflicts = groups
                .into_iter()
                .filter(|group| self.store.verify_group_ranks(*group).is_err())
                .collect();
            if !settlement.superseded.is_empty() {
                info!(
                    collection = %C::KIND,
                    seq,
                    superseded = settlement.superseded.len(),
                    "rolled back around later writes"
                );
            }
            if kind != OpKind::Repair {
                for group in settlement.conflicts.clone() {
                    warn!(collection = %C::KIND, %group, "duplicate ranks after rollback, renumbering");
                    if let Some(repair) = self.renumber_op(group, OpKind::Repair) {
                        settlement.repairs.push(repair);
                    }
                }
            }
            settlement
        }

        fn mark_started(&mut self, kind: OpKind) {
            if self.status != SyncStatus::Syncing {
                debug!(collection = %C::KIND, op = %kind, from = ?self.status, "syncing");
            }
            self.status = SyncStatus::Syncing;
        }

        /// `Synced` once nothing is left in flight. An error raised meanwhile stays
        /// visible until the next command starts or it is dismissed.
        fn mark_succeeded(&mut self, kind: OpKind) {
            debug!(collection = %C::KIND, op = %kind, "remote write confirmed");
            if self.in_flight.is_empty() && self.status == SyncStatus::Syncing {
                self.status = SyncStatus::Synced;
                self.last_error = None;
            }
        }

        /// A remote answer the store refused still ends the call, as a failure.
        fn accept(&mut self, kind: OpKind, upserted: Result<(), ValidationError>) -> Result<(), CommandError> {
            upserted.map_err(|error| {
                self.mark_failed(kind, &error);
                CommandError::from(error)
            })
        }

        fn mark_failed(&mut self, kind: OpKind, error: &dyn fmt::Display) {
            warn!(collection = %C::KIND, op = %kind, %error, "remote call failed");
            self.status = SyncStatus::Error;
            self.last_error = Some(error.to_string());
        }

        fn debug_verify(&self) {
            debug_assert!(
                self.store.verify().is_ok(),
                "date index drifted: {:?}",
                self.store.verify()
            );
        }
    }

    /* ------------------------------- View types ------------------------------- */

    /// Read-only snapshot handed to whatever renders the collection.
    #[derive(Debug, Clone, Serialize)]
    pub struct CollectionView<'a, C> {
        pub kind: CollectionKind,
        pub sync_status: SyncStatus,
        pub last_error: Option<&'a str>,
        pub days: Vec<DayView<'a, C>>,
    }

    #[derive(Debug, Clone, Serialize)]
    pub struct DayView<'a, C> {
        pub date: DateKey,
        pub buckets: Vec<BucketView<'a, C>>,
    }

    #[derive(Debug, Clone, Serialize)]
    pub struct BucketView<'a, C> {
        pub bucket: PriorityBucket,
        pub items: Vec<&'a Item<C>>,
    }

}

pub mod config {
    //! `planner.toml` plus environment overrides.

    use super::core::{OwnerId, PriorityBucket};
    use serde::{Deserialize, Serialize};
    use std::fs;
    use std::path::{Path, PathBuf};

    pub const CONFIG_FILE: &str = "planner.toml";

    #[derive(Debug, thiserror::Error)]
    pub enum ConfigError {
        #[error("failed to read {}: {source}", path.display())]
        Read {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("failed to parse {}: {source}", path.display())]
        Parse {
            path: PathBuf,
            source: toml::de::Error,
        },
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct PlannerConfig {
        pub owner: OwnerId,
        /// Holds `tasks.json`, `notes.json` and `events.json`.
        pub data_dir: PathBuf,
        pub default_bucket: PriorityBucket,
        pub logging: LoggingConfig,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct LoggingConfig {
        /// `tracing_subscriber::EnvFilter` directive.
        pub level: String,
    }

    impl Default for LoggingConfig {
        fn default() -> Self {
            Self {
                level: "info".to_string(),
            }
        }
    }

    /// One partially specified source. Present fields win over what came before.
    #[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
    #[serde(default, deny_unknown_fields)]
    pub struct ConfigLayer {
        pub owner: Option<OwnerId>,
        pub data_dir: Option<PathBuf>,
        pub default_bucket: Option<PriorityBucket>,
        pub logging: Option<LoggingLayer>,
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
    #[serde(default, deny_unknown_fields)]
    pub struct LoggingLayer {
        pub level: Option<String>,
    }

    impl ConfigLayer {
        pub fn apply_to(self, config: &mut PlannerConfig) {
            if let Some(owner) = self.owner {
                config.owner = owner;
            }
            if let Some(dir) = self.data_dir {
                config.data_dir = dir;
            }
            if let Some(bucket) = self.default_bucket {
                config.default_bucket = bucket;
            }
            if let Some(level) = self.logging.and_then(|logging| logging.level) {
                config.logging.level = level;
            }
        }
    }

    impl PlannerConfig {
        /// Defaults derived from `XDG_DATA_HOME`/`HOME` and `USER`.
        pub fn platform_default(lookup: impl Fn(&str) -> Option<String>) -> Self {
            let data_dir = match lookup("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
                Some(base) => PathBuf::from(base).join("planner"),
                None => lookup("HOME")
                    .map(|home| PathBuf::from(home).join(".local/share/planner"))
                    .unwrap_or_else(|| PathBuf::from(".planner")),
            };
            let owner = lookup("USER")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| "local".to_string());
            Self {
                owner: OwnerId::new(owner),
                data_dir,
                default_bucket: PriorityBucket::default(),
                logging: LoggingConfig::default(),
            }
        }

        /// `PLANNER_OWNER`, `PLANNER_DATA_DIR` and `PLANNER_LOG`. Blank values are ignored.
        pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
            let var = |name: &str| {
                lookup(name)
                    .map(|raw| raw.trim().to_string())
                    .filter(|raw| !raw.is_empty())
            };
            if let Some(owner) = var("PLANNER_OWNER") {
                self.owner = OwnerId::new(owner);
            }
            if let Some(dir) = var("PLANNER_DATA_DIR") {
                self.data_dir = PathBuf::from(dir);
            }
            if let Some(raw) = var("PLANNER_BUCKET") {
                match raw.parse::<PriorityBucket>() {
                    Ok(bucket) => self.default_bucket = bucket,
                    Err(err) => tracing::warn!("invalid PLANNER_BUCKET, ignoring: {err}"),
                }
            }
            if let Some(level) = var("PLANNER_LOG") {
                self.logging.level = level;
            }
        }
    }

    /// `$XDG_CONFIG_HOME/planner/planner.toml`, falling back to `~/.config`.
    pub fn default_config_path(lookup: impl Fn(&str) -> Option<String>) -> Option<PathBuf> {
        let base = match lookup("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
            Some(dir) => PathBuf::from(dir),
            None => PathBuf::from(lookup("HOME")?).join(".config"),
        };
        Some(base.join("planner").join(CONFIG_FILE))
    }

    pub fn load_layer(path: &Path) -> Result<Option<ConfigLayer>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents)
            .map(Some)
            .map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Resolve defaults, then the config file, then the process environment.
    pub fn load(explicit: Option<&Path>) -> Result<PlannerConfig, ConfigError> {
        load_with(explicit, |name| std::env::var(name).ok())
    }

    /// [`load`] with an injectable environment. An explicit path must exist; the
    /// default location is optional.
    pub fn load_with(
        explicit: Option<&Path>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<PlannerConfig, ConfigError> {
        let mut config = PlannerConfig::platform_default(&lookup);
        let layer = match explicit {
            Some(path) => {
                let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                Some(toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?)
            }
            None => match default_config_path(&lookup) {
                Some(path) => load_layer(&path)?,
                None => None,
            },
        };
        if let Some(layer) = layer {
            layer.apply_to(&mut config);
        }
        config.apply_env(&lookup);
        Ok(config)
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::collections::HashMap;

        fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
            let vars: HashMap<String, String> = pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            move |name: &str| vars.get(name).cloned()
        }

        #[test]
        fn defaults_follow_xdg_and_user() {
            let config = PlannerConfig::platform_default(env(&[
                ("HOME", "/home/kit"),
                ("USER", "kit"),
            ]));
            assert_eq!(config.owner, OwnerId::from("kit"));
            assert_eq!(config.data_dir, PathBuf::from("/home/kit/.local/share/planner"));
            assert_eq!(config.default_bucket, PriorityBucket::A);
            assert_eq!(config.logging.level, "info");

            let config = PlannerConfig::platform_default(env(&[("XDG_DATA_HOME", "/data")]));
            assert_eq!(config.data_dir, PathBuf::from("/data/planner"));
            assert_eq!(config.owner, OwnerId::from("local"));
        }

        #[test]
        fn file_then_env_override_defaults() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = tmp.path().join(CONFIG_FILE);
            fs::write(
                &path,
                "owner = \"file-owner\"\ndefault_bucket = \"C\"\n\n[logging]\nlevel = \"debug\"\n",
            )
            .expect("write config");

            let config = load_with(
                Some(&path),
                env(&[("HOME", "/home/kit"), ("PLANNER_DATA_DIR", "/srv/planner")]),
            )
            .expect("load");
            assert_eq!(config.owner, OwnerId::from("file-owner"));
            assert_eq!(config.default_bucket, PriorityBucket::C);
            assert_eq!(config.logging.level, "debug");
            assert_eq!(config.data_dir, PathBuf::from("/srv/planner"));
        }

        #[test]
        fn invalid_env_bucket_is_ignored() {
            let mut config = PlannerConfig::platform_default(env(&[]));
            config.apply_env(env(&[("PLANNER_BUCKET", "Z"), ("PLANNER_OWNER", "  ")]));
            assert_eq!(config.default_bucket, PriorityBucket::A);
            assert_eq!(config.owner, OwnerId::from("local"));
        }

        #[test]
        fn default_location_is_optional_but_explicit_is_not() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let home = tmp.path().to_string_lossy().to_string();
            assert!(load_with(None, env(&[("HOME", home.as_str())])).is_ok());

            let missing = tmp.path().join("nope.toml");
            assert!(matches!(
                load_with(Some(&missing), env(&[])),
                Err(ConfigError::Read { .. })
            ));
        }

        #[test]
        fn unknown_keys_are_rejected() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = tmp.path().join(CONFIG_FILE);
            fs::write(&path, "colour = \"blue\"\n").expect("write config");
            assert!(matches!(
                load_with(Some(&path), env(&[])),
                Err(ConfigError::Parse { .. })
            ));
        }
    }
}

pub mod planner {
    //! Composition root: one coordinator per collection, owned together.

    use super::config::PlannerConfig;
    use super::core::{EventContent, NoteContent, OwnerId, TaskContent};
    use super::remote::{JsonFileRemote, RemoteStore};
    use super::sync::{Collection, SyncStatus};

    pub struct Planner<T, N, E>
    where
        T: RemoteStore<TaskContent>,
        N: RemoteStore<NoteContent>,
        E: RemoteStore<EventContent>,
    {
        pub tasks: Collection<TaskContent, T>,
        pub notes: Collection<NoteContent, N>,
        pub events: Collection<EventContent, E>,
    }

    impl<T, N, E> Planner<T, N, E>
    where
        T: RemoteStore<TaskContent>,
        N: RemoteStore<NoteContent>,
        E: RemoteStore<EventContent>,
    {
        pub fn new(owner: OwnerId, tasks: T, notes: N, events: E) -> Self {
            Self {
                tasks: Collection::new(owner.clone(), tasks),
                notes: Collection::new(owner.clone(), notes),
                events: Collection::new(owner, events),
            }
        }

        /// `Error` if any collection is in error, else `Syncing` if any is busy.
        pub fn status(&self) -> SyncStatus {
            let all = [self.tasks.status(), self.notes.status(), self.events.status()];
            if all.contains(&SyncStatus::Error) {
                SyncStatus::Error
            } else if all.contains(&SyncStatus::Syncing) {
                SyncStatus::Syncing
            } else {
                SyncStatus::Synced
            }
        }
    }

    pub type FilePlanner = Planner<
        JsonFileRemote<TaskContent>,
        JsonFileRemote<NoteContent>,
        JsonFileRemote<EventContent>,
    >;

    impl FilePlanner {
        pub fn open(config: &PlannerConfig) -> Self {
            let dir = config.data_dir.as_path();
            Planner::new(
                config.owner.clone(),
                JsonFileRemote::in_dir(dir),
                JsonFileRemote::in_dir(dir),
                JsonFileRemote::in_dir(dir),
            )
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::core::{DateKey, GroupKey, ItemDraft, PriorityBucket};
        use crate::remote::{MemoryRemote, RemoteError};

        #[test]
        fn collections_share_an_owner_but_not_state() {
            let mut planner = Planner::new(
                OwnerId::from("me"),
                MemoryRemote::<TaskContent>::new(),
                MemoryRemote::<NoteContent>::new(),
                MemoryRemote::<EventContent>::new(),
            );
            let day = DateKey::from_ymd(2025, 1, 1).unwrap();
            planner
                .notes
                .create_item(ItemDraft::new(NoteContent::new("n", "")).on(day))
                .unwrap();
            planner.tasks.remote().fail_next(RemoteError::Network("down".into()));
            assert!(planner
                .tasks
                .create_item(ItemDraft::new(TaskContent::new("t")).on(day))
                .is_err());

            assert_eq!(planner.tasks.status(), SyncStatus::Error);
            assert_eq!(planner.notes.status(), SyncStatus::Synced);
            assert_eq!(planner.status(), SyncStatus::Error);
            assert_eq!(planner.notes.owner(), &OwnerId::from("me"));
            assert_eq!(planner.notes.store().ids_on(day).len(), 1);
            let group = GroupKey::new(day, PriorityBucket::A);
            assert!(planner.tasks.store().group_items(group).is_empty());
        }

        #[test]
        fn file_planner_writes_one_file_per_collection() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let mut config = PlannerConfig::platform_default(|_: &str| None);
            config.data_dir = tmp.path().to_path_buf();
            let mut planner = FilePlanner::open(&config);
            let day = DateKey::from_ymd(2025, 1, 1).unwrap();
            planner
                .events
                .create_item(ItemDraft::new(EventContent::new("standup")).on(day))
                .unwrap();

            assert!(tmp.path().join("events.json").exists());
            assert!(!tmp.path().join("tasks.json").exists());
        }
    }
}

pub use config::PlannerConfig;
pub use crate::core::{
    CollectionKind, DateKey, EventContent, GroupKey, Item, ItemContent, ItemDraft, ItemId, ItemPatch,
    NoteContent, OwnerId, PriorityBucket, TaskContent, ValidationError,
};
pub use planner::{FilePlanner, Planner};
pub use remote::{JsonFileRemote, MemoryRemote, RemoteError, RemoteStore};
pub use reorder::ReorderOutcome;
pub use sync::{Collection, CommandError, PendingOp, Settlement, SyncStatus};
