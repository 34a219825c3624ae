//! In-memory backend with fault injection.
//!
//! Implements enough of the native store's semantics to exercise the client's
//! pagination, chunking, and retry logic without a network: per-table key
//! schemas, key-ordered queries, conditional writes, and programmable
//! failures (unprocessed batch items, in-progress transactions, page-size
//! caps). Condition and update expressions are evaluated structurally and
//! support the subset this crate emits: `attribute_exists` /
//! `attribute_not_exists`, `begins_with`, comparisons, and `AND`/`OR`
//! combinations.

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use aws_sdk_dynamodb::types::AttributeValue;
use parking_lot::Mutex;

use crate::error::StoreError;
use crate::store::backend::{
    Attributes, BatchGetOutput, Page, PageRequest, StoreBackend, TransactPut, UpdateRequest,
    MAX_BATCH_GET_ITEMS, MAX_BATCH_WRITE_ITEMS,
};
use crate::store::item::Item;
use crate::store::update::{Condition, UpdateExpression};

struct MemTable {
    partition_key: String,
    sort_key: Option<String>,
    items: Vec<Attributes>,
}

/// An in-process stand-in for the remote store.
pub struct MemoryBackend {
    tables: Mutex<HashMap<String, MemTable>>,
    page_size: usize,
    unprocessed_put_rounds: AtomicUsize,
    unprocessed_get_rounds: AtomicUsize,
    in_progress_rounds: AtomicUsize,
    transact_tokens: Mutex<Vec<String>>,
    page_calls: AtomicUsize,
    batch_get_calls: AtomicUsize,
    batch_put_calls: AtomicUsize,
    transact_calls: AtomicUsize,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            page_size: usize::MAX,
            unprocessed_put_rounds: AtomicUsize::new(0),
            unprocessed_get_rounds: AtomicUsize::new(0),
            in_progress_rounds: AtomicUsize::new(0),
            transact_tokens: Mutex::new(Vec::new()),
            page_calls: AtomicUsize::new(0),
            batch_get_calls: AtomicUsize::new(0),
            batch_put_calls: AtomicUsize::new(0),
            transact_calls: AtomicUsize::new(0),
        }
    }

    /// Caps query/scan pages at `page_size` items, forcing cursor chaining.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Registers a table and its key schema.
    pub fn with_table(
        self,
        name: impl Into<String>,
        partition_key: impl Into<String>,
        sort_key: Option<&str>,
    ) -> Self {
        self.tables.lock().insert(
            name.into(),
            MemTable {
                partition_key: partition_key.into(),
                sort_key: sort_key.map(str::to_owned),
                items: Vec::new(),
            },
        );
        self
    }

    /// Inserts fixture items directly, without touching call counters.
    pub fn seed(
        &self,
        table: &str,
        items: impl IntoIterator<Item = Item>,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        let table = tables
            .get_mut(table)
            .ok_or_else(|| StoreError::InvalidRequest(format!("unknown table {table:?}")))?;
        for item in items {
            let attrs = item.into_attributes();
            table.check_key(&attrs)?;
            table.put(attrs);
        }
        Ok(())
    }

    /// The next `rounds` batch-write chunks report every item unprocessed.
    /// `usize::MAX` keeps failing forever.
    pub fn fail_batch_puts(&self, rounds: usize) {
        self.unprocessed_put_rounds.store(rounds, Ordering::SeqCst);
    }

    /// The next `rounds` batch-read chunks report every key unprocessed.
    pub fn fail_batch_gets(&self, rounds: usize) {
        self.unprocessed_get_rounds.store(rounds, Ordering::SeqCst);
    }

    /// The next `rounds` transactional writes report "in progress".
    pub fn hold_transactions(&self, rounds: usize) {
        self.in_progress_rounds.store(rounds, Ordering::SeqCst);
    }

    /// Idempotency tokens seen by `transact_put`, in call order.
    pub fn transact_tokens(&self) -> Vec<String> {
        self.transact_tokens.lock().clone()
    }

    pub fn page_calls(&self) -> usize {
        self.page_calls.load(Ordering::SeqCst)
    }

    pub fn batch_get_calls(&self) -> usize {
        self.batch_get_calls.load(Ordering::SeqCst)
    }

    pub fn batch_put_calls(&self) -> usize {
        self.batch_put_calls.load(Ordering::SeqCst)
    }

    pub fn transact_calls(&self) -> usize {
        self.transact_calls.load(Ordering::SeqCst)
    }
}

/// Consumes one failure round; `usize::MAX` means "always fail".
fn consume_round(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |rounds| match rounds {
            0 => None,
            usize::MAX => Some(usize::MAX),
            rounds => Some(rounds - 1),
        })
        .is_ok()
}

impl MemTable {
    fn check_key(&self, item: &Attributes) -> Result<(), StoreError> {
        if !item.contains_key(&self.partition_key) {
            return Err(StoreError::InvalidRequest(format!(
                "item is missing key attribute {:?}",
                self.partition_key
            )));
        }
        if let Some(sort_key) = &self.sort_key {
            if !item.contains_key(sort_key) {
                return Err(StoreError::InvalidRequest(format!(
                    "item is missing key attribute {sort_key:?}"
                )));
            }
        }
        Ok(())
    }

    fn key_of(&self, item: &Attributes) -> Attributes {
        let mut key = HashMap::new();
        if let Some(value) = item.get(&self.partition_key) {
            key.insert(self.partition_key.clone(), value.clone());
        }
        if let Some(sort_key) = &self.sort_key {
            if let Some(value) = item.get(sort_key) {
                key.insert(sort_key.clone(), value.clone());
            }
        }
        key
    }

    fn position(&self, key: &Attributes) -> Option<usize> {
        self.items.iter().position(|item| self.key_of(item) == *key)
    }

    fn put(&mut self, item: Attributes) {
        let key = self.key_of(&item);
        match self.position(&key) {
            Some(position) => self.items[position] = item,
            None => self.items.push(item),
        }
    }
}

fn resolve_name<'a>(
    token: &'a str,
    names: &'a HashMap<String, String>,
) -> Result<&'a str, StoreError> {
    if token.starts_with('#') {
        names
            .get(token)
            .map(String::as_str)
            .ok_or_else(|| StoreError::InvalidRequest(format!("unbound name placeholder {token}")))
    } else {
        Ok(token)
    }
}

fn resolve_value<'a>(token: &'a str, values: &'a Attributes) -> Result<&'a AttributeValue, StoreError> {
    values
        .get(token)
        .ok_or_else(|| StoreError::InvalidRequest(format!("unbound value placeholder {token}")))
}

fn compare(a: &AttributeValue, b: &AttributeValue) -> Option<CmpOrdering> {
    match (a, b) {
        (AttributeValue::N(a), AttributeValue::N(b)) => {
            a.parse::<f64>().ok()?.partial_cmp(&b.parse::<f64>().ok()?)
        }
        (AttributeValue::S(a), AttributeValue::S(b)) => Some(a.cmp(b)),
        (AttributeValue::B(a), AttributeValue::B(b)) => Some(a.as_ref().cmp(b.as_ref())),
        _ => None,
    }
}

fn eval_predicate(
    predicate: &str,
    names: &HashMap<String, String>,
    values: &Attributes,
    item: Option<&Attributes>,
) -> Result<bool, StoreError> {
    let predicate = predicate.trim();

    if let Some(inner) = predicate
        .strip_prefix("attribute_not_exists(")
        .and_then(|rest| rest.strip_suffix(')'))
    {
        let name = resolve_name(inner.trim(), names)?;
        return Ok(item.map_or(true, |item| !item.contains_key(name)));
    }
    if let Some(inner) = predicate
        .strip_prefix("attribute_exists(")
        .and_then(|rest| rest.strip_suffix(')'))
    {
        let name = resolve_name(inner.trim(), names)?;
        return Ok(item.is_some_and(|item| item.contains_key(name)));
    }
    if let Some(inner) = predicate
        .strip_prefix("begins_with(")
        .and_then(|rest| rest.strip_suffix(')'))
    {
        let (name_token, value_token) = inner.split_once(',').ok_or_else(|| {
            StoreError::InvalidRequest(format!("malformed begins_with in {predicate:?}"))
        })?;
        let name = resolve_name(name_token.trim(), names)?;
        let prefix = resolve_value(value_token.trim(), values)?;
        return Ok(match (item.and_then(|item| item.get(name)), prefix) {
            (Some(AttributeValue::S(value)), AttributeValue::S(prefix)) => {
                value.starts_with(prefix)
            }
            _ => false,
        });
    }

    let mut tokens = predicate.split_whitespace();
    let (Some(lhs), Some(op), Some(rhs), None) =
        (tokens.next(), tokens.next(), tokens.next(), tokens.next())
    else {
        return Err(StoreError::InvalidRequest(format!(
            "unsupported condition predicate {predicate:?}"
        )));
    };

    let name = resolve_name(lhs, names)?;
    let expected = resolve_value(rhs, values)?;
    let Some(actual) = item.and_then(|item| item.get(name)) else {
        return Ok(false);
    };

    Ok(match op {
        "=" => actual == expected,
        "<>" => actual != expected,
        "<" => compare(actual, expected) == Some(CmpOrdering::Less),
        "<=" => matches!(
            compare(actual, expected),
            Some(CmpOrdering::Less | CmpOrdering::Equal)
        ),
        ">" => compare(actual, expected) == Some(CmpOrdering::Greater),
        ">=" => matches!(
            compare(actual, expected),
            Some(CmpOrdering::Greater | CmpOrdering::Equal)
        ),
        _ => {
            return Err(StoreError::InvalidRequest(format!(
                "unsupported operator {op:?}"
            )))
        }
    })
}

fn eval_condition(
    expression: &str,
    names: &HashMap<String, String>,
    values: &Attributes,
    item: Option<&Attributes>,
) -> Result<bool, StoreError> {
    for disjunct in expression.split(" OR ") {
        let mut holds = true;
        for conjunct in disjunct.split(" AND ") {
            if !eval_predicate(conjunct, names, values, item)? {
                holds = false;
                break;
            }
        }
        if holds {
            return Ok(true);
        }
    }
    Ok(false)
}

fn apply_update(
    item: &mut Attributes,
    update: &UpdateExpression,
    names: &HashMap<String, String>,
    values: &Attributes,
) -> Result<(), StoreError> {
    for clause in &update.set {
        let (lhs, rhs) = clause.split_once('=').ok_or_else(|| {
            StoreError::InvalidRequest(format!("malformed SET clause {clause:?}"))
        })?;
        let name = resolve_name(lhs.trim(), names)?;
        let value = resolve_value(rhs.trim(), values)?;
        item.insert(name.to_owned(), value.clone());
    }
    for clause in &update.remove {
        let name = resolve_name(clause.trim(), names)?;
        item.remove(name);
    }
    for clause in &update.add {
        let mut tokens = clause.split_whitespace();
        let (Some(lhs), Some(rhs), None) = (tokens.next(), tokens.next(), tokens.next()) else {
            return Err(StoreError::InvalidRequest(format!(
                "malformed ADD clause {clause:?}"
            )));
        };
        let name = resolve_name(lhs, names)?;
        let delta = resolve_value(rhs, values)?;
        let current = item
            .get(name)
            .and_then(|value| value.as_n().ok())
            .and_then(|n| n.parse::<f64>().ok())
            .unwrap_or(0.0);
        let delta = delta
            .as_n()
            .ok()
            .and_then(|n| n.parse::<f64>().ok())
            .ok_or_else(|| {
                StoreError::InvalidRequest(format!("ADD requires a numeric value in {clause:?}"))
            })?;
        item.insert(name.to_owned(), AttributeValue::N((current + delta).to_string()));
    }
    for clause in &update.delete {
        let mut tokens = clause.split_whitespace();
        let (Some(lhs), Some(rhs), None) = (tokens.next(), tokens.next(), tokens.next()) else {
            return Err(StoreError::InvalidRequest(format!(
                "malformed DELETE clause {clause:?}"
            )));
        };
        let name = resolve_name(lhs, names)?;
        let subset = resolve_value(rhs, values)?;
        if let (Some(AttributeValue::Ss(current)), AttributeValue::Ss(subset)) =
            (item.get(name).cloned(), subset)
        {
            let remaining: Vec<String> = current
                .into_iter()
                .filter(|member| !subset.contains(member))
                .collect();
            if remaining.is_empty() {
                item.remove(name);
            } else {
                item.insert(name.to_owned(), AttributeValue::Ss(remaining));
            }
        }
    }
    Ok(())
}

#[async_trait]
impl StoreBackend for MemoryBackend {
    async fn get_item(
        &self,
        table: &str,
        key: Attributes,
    ) -> Result<Option<Attributes>, StoreError> {
        let tables = self.tables.lock();
        let table = tables
            .get(table)
            .ok_or_else(|| StoreError::InvalidRequest(format!("unknown table {table:?}")))?;
        Ok(table.position(&key).map(|position| table.items[position].clone()))
    }

    async fn put_item(
        &self,
        table: &str,
        item: Attributes,
        condition: Option<Condition>,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        let table = tables
            .get_mut(table)
            .ok_or_else(|| StoreError::InvalidRequest(format!("unknown table {table:?}")))?;
        table.check_key(&item)?;
        let existing = table.position(&table.key_of(&item)).map(|p| table.items[p].clone());
        if let Some(condition) = condition {
            if !eval_condition(
                &condition.expression,
                &condition.names,
                &condition.values,
                existing.as_ref(),
            )? {
                return Err(StoreError::ConditionFailed);
            }
        }
        table.put(item);
        Ok(())
    }

    async fn delete_item(
        &self,
        table: &str,
        key: Attributes,
    ) -> Result<Option<Attributes>, StoreError> {
        let mut tables = self.tables.lock();
        let table = tables
            .get_mut(table)
            .ok_or_else(|| StoreError::InvalidRequest(format!("unknown table {table:?}")))?;
        Ok(table.position(&key).map(|position| table.items.remove(position)))
    }

    async fn update_item(&self, request: UpdateRequest) -> Result<Attributes, StoreError> {
        let mut tables = self.tables.lock();
        let table = tables
            .get_mut(&request.table)
            .ok_or_else(|| StoreError::InvalidRequest(format!("unknown table {:?}", request.table)))?;
        let position = table.position(&request.key);
        let existing = position.map(|p| table.items[p].clone());
        if let Some(condition) = &request.condition {
            if !eval_condition(condition, &request.names, &request.values, existing.as_ref())? {
                return Err(StoreError::ConditionFailed);
            }
        }
        // Updating a missing item upserts it from its key, as the store does.
        let mut item = existing.unwrap_or_else(|| request.key.clone());
        apply_update(&mut item, &request.update, &request.names, &request.values)?;
        match position {
            Some(position) => table.items[position] = item.clone(),
            None => table.items.push(item.clone()),
        }
        Ok(item)
    }

    async fn page(&self, request: PageRequest) -> Result<Page, StoreError> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);
        let tables = self.tables.lock();
        let table = tables
            .get(&request.table)
            .ok_or_else(|| StoreError::InvalidRequest(format!("unknown table {:?}", request.table)))?;

        let mut matching = Vec::new();
        for item in &table.items {
            if let Some(key_condition) = &request.key_condition {
                if !eval_condition(key_condition, &request.names, &request.values, Some(item))? {
                    continue;
                }
            }
            if let Some(filter) = &request.filter {
                if !eval_condition(filter, &request.names, &request.values, Some(item))? {
                    continue;
                }
            }
            matching.push(item.clone());
        }

        // Queries come back in key order; scans keep insertion order.
        if request.key_condition.is_some() {
            if let Some(sort_key) = table.sort_key.clone() {
                matching.sort_by(|a, b| {
                    match (a.get(&sort_key), b.get(&sort_key)) {
                        (Some(a), Some(b)) => compare(a, b).unwrap_or(CmpOrdering::Equal),
                        _ => CmpOrdering::Equal,
                    }
                });
            }
            if request.scan_forward == Some(false) {
                matching.reverse();
            }
        }

        let start = match &request.exclusive_start_key {
            Some(start_key) => matching
                .iter()
                .position(|item| table.key_of(item) == *start_key)
                .map(|position| position + 1)
                .unwrap_or(0),
            None => 0,
        };
        let page_limit = request.limit.unwrap_or(usize::MAX).min(self.page_size);
        let end = matching.len().min(start.saturating_add(page_limit));

        let items: Vec<Attributes> = matching[start..end].to_vec();
        let last_evaluated_key = if end < matching.len() {
            items.last().map(|item| table.key_of(item))
        } else {
            None
        };
        let count = items.len();
        Ok(Page {
            items: if request.count_only { Vec::new() } else { items },
            last_evaluated_key,
            count,
        })
    }

    async fn batch_get(
        &self,
        table: &str,
        keys: Vec<Attributes>,
        _consistent: bool,
    ) -> Result<BatchGetOutput, StoreError> {
        self.batch_get_calls.fetch_add(1, Ordering::SeqCst);
        if keys.len() > MAX_BATCH_GET_ITEMS {
            return Err(StoreError::InvalidRequest(format!(
                "batch read of {} keys exceeds the {MAX_BATCH_GET_ITEMS}-key ceiling",
                keys.len()
            )));
        }
        if consume_round(&self.unprocessed_get_rounds) {
            return Ok(BatchGetOutput {
                items: Vec::new(),
                unprocessed_keys: keys,
            });
        }
        let tables = self.tables.lock();
        let table = tables
            .get(table)
            .ok_or_else(|| StoreError::InvalidRequest(format!("unknown table {table:?}")))?;
        let items = keys
            .iter()
            .filter_map(|key| table.position(key).map(|position| table.items[position].clone()))
            .collect();
        Ok(BatchGetOutput {
            items,
            unprocessed_keys: Vec::new(),
        })
    }

    async fn batch_put(
        &self,
        table: &str,
        items: Vec<Attributes>,
    ) -> Result<Vec<Attributes>, StoreError> {
        self.batch_put_calls.fetch_add(1, Ordering::SeqCst);
        if items.len() > MAX_BATCH_WRITE_ITEMS {
            return Err(StoreError::InvalidRequest(format!(
                "batch write of {} items exceeds the {MAX_BATCH_WRITE_ITEMS}-item ceiling",
                items.len()
            )));
        }
        if consume_round(&self.unprocessed_put_rounds) {
            return Ok(items);
        }
        let mut tables = self.tables.lock();
        let table = tables
            .get_mut(table)
            .ok_or_else(|| StoreError::InvalidRequest(format!("unknown table {table:?}")))?;
        for item in items {
            table.check_key(&item)?;
            table.put(item);
        }
        Ok(Vec::new())
    }

    async fn transact_put(&self, puts: Vec<TransactPut>, token: &str) -> Result<(), StoreError> {
        self.transact_calls.fetch_add(1, Ordering::SeqCst);
        self.transact_tokens.lock().push(token.to_owned());
        if consume_round(&self.in_progress_rounds) {
            return Err(StoreError::TransactionInProgress);
        }
        let mut tables = self.tables.lock();
        for put in &puts {
            let table = tables.get(&put.table).ok_or_else(|| {
                StoreError::InvalidRequest(format!("unknown table {:?}", put.table))
            })?;
            table.check_key(&put.item)?;
        }
        for put in puts {
            if let Some(table) = tables.get_mut(&put.table) {
                table.put(put.item);
            }
        }
        Ok(())
    }
}
