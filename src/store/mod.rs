//! The Store: durable, concurrent-safe state for features, dependencies,
//! heartbeats and branches. Grounded on `original_source/core/database.py`.

pub mod backoff;
pub mod models;

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::instrument;

pub use models::*;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("feature {0} not found")]
    FeatureNotFound(i64),
    #[error("invalid feature data: {0}")]
    InvalidData(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Embedded relational store shared by the Orchestrator and every worker
/// process. Pragmas (WAL, `synchronous=NORMAL`, `busy_timeout`,
/// `foreign_keys=ON`) are applied once against the pool in [`Store::open`].
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Wrap an already-migrated pool and apply the required pragmas.
    pub async fn open(pool: SqlitePool) -> Result<Self> {
        sqlx::query("PRAGMA journal_mode=WAL").execute(&pool).await?;
        sqlx::query("PRAGMA synchronous=NORMAL").execute(&pool).await?;
        sqlx::query("PRAGMA busy_timeout=10000").execute(&pool).await?;
        sqlx::query("PRAGMA foreign_keys=ON").execute(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ---- Feature CRUD -------------------------------------------------

    #[instrument(skip(self, steps))]
    pub async fn create_feature(
        &self,
        name: &str,
        description: &str,
        category: &str,
        steps: &[String],
        priority: i64,
        depends_on: &[i64],
    ) -> Result<i64> {
        let steps_json = serde_json::to_string(steps)
            .map_err(|e| StoreError::InvalidData(e.to_string()))?;

        let mut tx = self.pool.begin().await?;
        let rec = sqlx::query(
            r#"
            INSERT INTO features (name, description, category, steps, priority)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(name)
        .bind(description)
        .bind(category)
        .bind(&steps_json)
        .bind(priority)
        .execute(&mut *tx)
        .await?;

        let id = rec.last_insert_rowid();

        for dep in depends_on {
            sqlx::query(
                "INSERT INTO feature_dependencies (feature_id, depends_on_id) VALUES (?1, ?2)",
            )
            .bind(id)
            .bind(dep)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(id)
    }

    pub async fn create_features_bulk(&self, features: &[NewFeature]) -> Result<usize> {
        let mut count = 0;
        for f in features {
            self.create_feature(
                &f.name,
                &f.description,
                &f.category,
                &f.steps,
                f.priority,
                &f.depends_on,
            )
            .await?;
            count += 1;
        }
        Ok(count)
    }

    pub async fn get_feature(&self, id: i64) -> Result<Option<Feature>> {
        let row = sqlx::query("SELECT * FROM features WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_feature).transpose()
    }

    pub async fn get_features_by_status(&self, status: FeatureStatus) -> Result<Vec<Feature>> {
        let rows = sqlx::query("SELECT * FROM features WHERE status = ?1 ORDER BY priority DESC, id ASC")
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_feature).collect()
    }

    // ---- Claiming -------------------------------------------------------

    /// Atomically claim the highest-priority runnable PENDING feature.
    ///
    /// Grounded on `database.py`'s `claim_next_pending_feature`: select a
    /// candidate, guard the UPDATE with `WHERE status = 'PENDING'`, and
    /// retry on a lost race. `prioritize_blockers` only breaks ties within
    /// the same priority value (SPEC_FULL.md §9(c)) — it never overrides
    /// `priority`.
    #[instrument(skip(self))]
    pub async fn claim_next_pending_feature(
        &self,
        agent_id: &str,
        branch_prefix: &str,
        max_attempts: u32,
        prioritize_blockers: bool,
    ) -> Result<Option<Feature>> {
        for _ in 0..max_attempts.max(1) {
            let Some(candidate) = self.select_claim_candidate(prioritize_blockers).await? else {
                return Ok(None);
            };

            let branch_name = match &candidate.branch_name {
                Some(existing) => existing.clone(),
                None => format!("{branch_prefix}/{}-{}", candidate.id, Utc::now().timestamp()),
            };

            let now = Utc::now();
            let updated = sqlx::query(
                r#"
                UPDATE features
                SET status = 'IN_PROGRESS',
                    assigned_agent_id = ?1,
                    assigned_at = ?2,
                    branch_name = ?3,
                    updated_at = ?2
                WHERE id = ?4 AND status = 'PENDING'
                "#,
            )
            .bind(agent_id)
            .bind(now.to_rfc3339())
            .bind(&branch_name)
            .bind(candidate.id)
            .execute(&self.pool)
            .await?;

            if updated.rows_affected() == 1 {
                return self.get_feature(candidate.id).await;
            }
            // Lost the race to another claimer; loop and re-scan.
        }
        Ok(None)
    }

    async fn select_claim_candidate(&self, prioritize_blockers: bool) -> Result<Option<Feature>> {
        let now = Utc::now().to_rfc3339();
        let rows = sqlx::query(
            r#"
            SELECT f.* FROM features f
            WHERE f.status = 'PENDING'
              AND (f.next_attempt_at IS NULL OR f.next_attempt_at <= ?1)
              AND NOT EXISTS (
                  SELECT 1 FROM feature_dependencies d
                  JOIN features dep ON dep.id = d.depends_on_id
                  WHERE d.feature_id = f.id AND dep.status != 'DONE'
              )
            ORDER BY f.priority DESC, f.id ASC
            "#,
        )
        .bind(&now)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(None);
        }

        let mut candidates: Vec<Feature> = rows.into_iter().map(row_to_feature).collect::<Result<_>>()?;

        if prioritize_blockers && candidates.len() > 1 {
            let top_priority = candidates[0].priority;
            let unblock_counts = self.pending_unblock_counts().await?;
            candidates.sort_by(|a, b| {
                if a.priority != top_priority || b.priority != top_priority || a.priority != b.priority {
                    b.priority.cmp(&a.priority).then(a.id.cmp(&b.id))
                } else {
                    let ua = unblock_counts.get(&a.id).copied().unwrap_or(0);
                    let ub = unblock_counts.get(&b.id).copied().unwrap_or(0);
                    ub.cmp(&ua).then(a.id.cmp(&b.id))
                }
            });
        }

        Ok(candidates.into_iter().next())
    }

    /// Count, for every feature, how many PENDING features depend on it.
    async fn pending_unblock_counts(&self) -> Result<HashMap<i64, i64>> {
        let rows = sqlx::query(
            r#"
            SELECT d.depends_on_id as dep_id, COUNT(*) as cnt
            FROM feature_dependencies d
            JOIN features f ON f.id = d.feature_id
            WHERE f.status = 'PENDING'
            GROUP BY d.depends_on_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut map = HashMap::new();
        for row in rows {
            let dep_id: i64 = row.try_get("dep_id")?;
            let cnt: i64 = row.try_get("cnt")?;
            map.insert(dep_id, cnt);
        }
        Ok(map)
    }

    pub async fn requeue_feature(&self, id: i64, preserve_branch: bool) -> Result<()> {
        if preserve_branch {
            sqlx::query(
                "UPDATE features SET status = 'PENDING', assigned_agent_id = NULL, updated_at = ?1 WHERE id = ?2",
            )
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query(
                "UPDATE features SET status = 'PENDING', assigned_agent_id = NULL, branch_name = NULL, updated_at = ?1 WHERE id = ?2",
            )
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    // ---- Lifecycle transitions ------------------------------------------

    pub async fn mark_feature_ready_for_verification(&self, id: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE features
            SET review_status = 'READY_FOR_VERIFICATION', passes = 0, updated_at = ?1
            WHERE id = ?2
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_feature_passing(&self, id: i64) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            UPDATE features
            SET status = 'DONE', passes = 1, review_status = 'VERIFIED',
                completed_at = ?1, updated_at = ?1
            WHERE id = ?2
            "#,
        )
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The heart of retry/blocking logic. See SPEC_FULL.md §4.1 and
    /// `database.py`'s `mark_feature_failed`.
    #[instrument(skip(self, reason))]
    pub async fn mark_feature_failed(
        &self,
        id: i64,
        reason: &str,
        artifact_path: Option<&str>,
        diff_fingerprint: Option<&str>,
        preserve_branch: bool,
        next_status_override: Option<FeatureStatus>,
        retry: &backoff::RetryPolicyParams,
    ) -> Result<()> {
        let feature = self
            .get_feature(id)
            .await?
            .ok_or(StoreError::FeatureNotFound(id))?;

        let error_key = backoff::normalize_error_key(reason);
        let same_error_streak = if Some(&error_key) == feature.last_error_key.as_ref() {
            feature.same_error_streak + 1
        } else {
            1
        };

        let same_diff_streak = match diff_fingerprint {
            Some(fp) if Some(fp) == feature.last_diff_fingerprint.as_deref() => {
                feature.same_diff_streak + 1
            }
            Some(_) => 1,
            None => feature.same_diff_streak,
        };

        let attempts = feature.attempts + 1;

        let attempts_exceeded = attempts as u32 >= retry.max_attempts;
        let error_streak_exceeded = same_error_streak as u32 >= retry.max_same_error_streak;
        let diff_streak_exceeded = same_diff_streak as u32 >= retry.max_same_diff_streak;

        let should_block = attempts_exceeded || error_streak_exceeded || diff_streak_exceeded;

        let mut last_error = reason.to_string();
        let blocked_reason = if should_block {
            let why = if attempts_exceeded {
                format!("attempts exceeded ({attempts} >= {})", retry.max_attempts)
            } else if error_streak_exceeded {
                format!(
                    "same error repeated {same_error_streak} times"
                )
            } else {
                "no code progress detected across retries".to_string()
            };
            last_error = format!("{reason}\nblocked: {why}");
            Some(why)
        } else {
            None
        };

        let now = Utc::now();
        let next_attempt_at = if should_block {
            None
        } else {
            let delay_s = backoff::next_retry_delay_s(
                attempts as u32,
                retry.initial_delay_s,
                retry.exponential_base,
                retry.max_delay_s,
                retry.jitter,
            );
            Some(now + Duration::seconds(delay_s as i64))
        };

        let next_status = if should_block {
            FeatureStatus::Blocked
        } else {
            next_status_override.unwrap_or(FeatureStatus::Pending)
        };

        if !preserve_branch {
            sqlx::query(
                r#"
                UPDATE features
                SET status = ?1, attempts = ?2, last_error = ?3, last_error_key = ?4,
                    same_error_streak = ?5, same_diff_streak = ?6,
                    last_artifact_path = COALESCE(?7, last_artifact_path),
                    last_diff_fingerprint = COALESCE(?8, last_diff_fingerprint),
                    next_attempt_at = ?9, last_blocked_reason = ?10,
                    assigned_agent_id = NULL, updated_at = ?11
                WHERE id = ?12
                "#,
            )
            .bind(next_status.as_str())
            .bind(attempts)
            .bind(&last_error)
            .bind(&error_key)
            .bind(same_error_streak)
            .bind(same_diff_streak)
            .bind(artifact_path)
            .bind(diff_fingerprint)
            .bind(next_attempt_at.map(|d| d.to_rfc3339()))
            .bind(&blocked_reason)
            .bind(now.to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query(
                r#"
                UPDATE features
                SET status = ?1, attempts = ?2, last_error = ?3, last_error_key = ?4,
                    same_error_streak = ?5, same_diff_streak = ?6,
                    last_artifact_path = COALESCE(?7, last_artifact_path),
                    last_diff_fingerprint = COALESCE(?8, last_diff_fingerprint),
                    next_attempt_at = ?9, last_blocked_reason = ?10,
                    updated_at = ?11
                WHERE id = ?12
                "#,
            )
            .bind(next_status.as_str())
            .bind(attempts)
            .bind(&last_error)
            .bind(&error_key)
            .bind(same_error_streak)
            .bind(same_diff_streak)
            .bind(artifact_path)
            .bind(diff_fingerprint)
            .bind(next_attempt_at.map(|d| d.to_rfc3339()))
            .bind(&blocked_reason)
            .bind(now.to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    pub async fn block_feature(&self, id: i64, reason: &str, preserve_branch: bool) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        if preserve_branch {
            sqlx::query(
                "UPDATE features SET status = 'BLOCKED', last_blocked_reason = ?1, updated_at = ?2 WHERE id = ?3",
            )
            .bind(reason)
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query(
                "UPDATE features SET status = 'BLOCKED', last_blocked_reason = ?1, assigned_agent_id = NULL, updated_at = ?2 WHERE id = ?3",
            )
            .bind(reason)
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    /// Two-phase pass: propagate BLOCKED across dependency edges to a
    /// fixpoint, then DFS-detect cycles among the remaining non-BLOCKED
    /// PENDING features and block every cycle participant. Grounded on
    /// `database.py`'s `block_unresolvable_dependencies`.
    #[instrument(skip(self))]
    pub async fn block_unresolvable_dependencies(&self) -> Result<usize> {
        let mut blocked_count = 0;

        loop {
            let rows = sqlx::query(
                r#"
                SELECT DISTINCT f.id FROM features f
                JOIN feature_dependencies d ON d.feature_id = f.id
                JOIN features dep ON dep.id = d.depends_on_id
                WHERE f.status = 'PENDING' AND dep.status = 'BLOCKED'
                "#,
            )
            .fetch_all(&self.pool)
            .await?;

            if rows.is_empty() {
                break;
            }

            for row in &rows {
                let id: i64 = row.try_get("id")?;
                self.block_feature(id, "dependency blocked", true).await?;
                blocked_count += 1;
            }
        }

        // Cycle detection among remaining PENDING features.
        let edges = sqlx::query(
            r#"
            SELECT d.feature_id, d.depends_on_id FROM feature_dependencies d
            JOIN features f ON f.id = d.feature_id
            JOIN features dep ON dep.id = d.depends_on_id
            WHERE f.status = 'PENDING' AND dep.status != 'DONE' AND dep.status != 'BLOCKED'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut graph: HashMap<i64, Vec<i64>> = HashMap::new();
        for row in edges {
            let from: i64 = row.try_get("feature_id")?;
            let to: i64 = row.try_get("depends_on_id")?;
            graph.entry(from).or_default().push(to);
        }

        let cycle_members = detect_cycle_members(&graph);
        for id in &cycle_members {
            self.block_feature(*id, "dependency cycle detected", true).await?;
            blocked_count += 1;
        }

        Ok(blocked_count)
    }

    // ---- Agents ----------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub async fn register_agent(
        &self,
        agent_id: &str,
        worktree_path: &str,
        feature_id: i64,
        pid: i64,
        process_created_at: Option<DateTime<Utc>>,
        api_port: i64,
        web_port: i64,
        log_file_path: Option<&str>,
        start_ticks: Option<i64>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO agent_heartbeats
                (agent_id, last_ping, status, worktree_path, feature_id, pid,
                 started_at, process_created_at, api_port, web_port, log_file_path,
                 start_ticks)
            VALUES (?1, ?2, 'ACTIVE', ?3, ?4, ?5, ?2, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(agent_id) DO UPDATE SET
                last_ping = excluded.last_ping, status = 'ACTIVE',
                worktree_path = excluded.worktree_path, feature_id = excluded.feature_id,
                pid = excluded.pid, started_at = excluded.started_at,
                process_created_at = excluded.process_created_at,
                api_port = excluded.api_port, web_port = excluded.web_port,
                log_file_path = excluded.log_file_path,
                start_ticks = excluded.start_ticks
            "#,
        )
        .bind(agent_id)
        .bind(&now)
        .bind(worktree_path)
        .bind(feature_id)
        .bind(pid)
        .bind(process_created_at.map(|d| d.to_rfc3339()))
        .bind(api_port)
        .bind(web_port)
        .bind(log_file_path)
        .bind(start_ticks)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_heartbeat(&self, agent_id: &str) -> Result<()> {
        sqlx::query("UPDATE agent_heartbeats SET last_ping = ?1 WHERE agent_id = ?2")
            .bind(Utc::now().to_rfc3339())
            .bind(agent_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_agent_completed(&self, agent_id: &str) -> Result<()> {
        sqlx::query("UPDATE agent_heartbeats SET status = 'COMPLETED' WHERE agent_id = ?1")
            .bind(agent_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_agent_crashed(&self, agent_id: &str) -> Result<()> {
        sqlx::query("UPDATE agent_heartbeats SET status = 'CRASHED' WHERE agent_id = ?1")
            .bind(agent_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn remove_heartbeat(&self, agent_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM agent_heartbeats WHERE agent_id = ?1")
            .bind(agent_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_stale_agents(&self, timeout_minutes: i64) -> Result<Vec<AgentHeartbeat>> {
        let cutoff = (Utc::now() - Duration::minutes(timeout_minutes)).to_rfc3339();
        let rows = sqlx::query(
            "SELECT * FROM agent_heartbeats WHERE status = 'ACTIVE' AND last_ping < ?1",
        )
        .bind(&cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_heartbeat).collect()
    }

    pub async fn get_active_agents(&self) -> Result<Vec<AgentHeartbeat>> {
        let rows = sqlx::query("SELECT * FROM agent_heartbeats WHERE status = 'ACTIVE'")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_heartbeat).collect()
    }

    pub async fn get_completed_agents(&self) -> Result<Vec<AgentHeartbeat>> {
        let rows = sqlx::query("SELECT * FROM agent_heartbeats WHERE status = 'COMPLETED'")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_heartbeat).collect()
    }

    // ---- Branch audit ------------------------------------------------------

    pub async fn record_branch_merge(
        &self,
        branch_name: &str,
        feature_id: i64,
        agent_id: &str,
        commit_hash: &str,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO branches (branch_name, feature_id, agent_id, created_at, merged_at, commit_hash)
            VALUES (?1, ?2, ?3, ?4, ?4, ?5)
            ON CONFLICT(branch_name) DO UPDATE SET merged_at = excluded.merged_at, commit_hash = excluded.commit_hash
            "#,
        )
        .bind(branch_name)
        .bind(feature_id)
        .bind(agent_id)
        .bind(&now)
        .bind(commit_hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---- Reporting ---------------------------------------------------------

    pub async fn get_stats(&self) -> Result<Stats> {
        let row = sqlx::query(
            r#"
            SELECT
                SUM(CASE WHEN status = 'PENDING' THEN 1 ELSE 0 END) as pending,
                SUM(CASE WHEN status = 'IN_PROGRESS' THEN 1 ELSE 0 END) as in_progress,
                SUM(CASE WHEN status = 'DONE' THEN 1 ELSE 0 END) as done,
                SUM(CASE WHEN status = 'BLOCKED' THEN 1 ELSE 0 END) as blocked,
                COUNT(*) as total
            FROM features
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(Stats {
            pending: row.try_get::<Option<i64>, _>("pending")?.unwrap_or(0),
            in_progress: row.try_get::<Option<i64>, _>("in_progress")?.unwrap_or(0),
            done: row.try_get::<Option<i64>, _>("done")?.unwrap_or(0),
            blocked: row.try_get::<Option<i64>, _>("blocked")?.unwrap_or(0),
            total: row.try_get("total")?,
        })
    }

    pub async fn get_progress(&self) -> Result<Progress> {
        let stats = self.get_stats().await?;
        let fraction = if stats.total > 0 {
            stats.done as f64 / stats.total as f64
        } else {
            0.0
        };
        Ok(Progress {
            total: stats.total,
            done: stats.done,
            fraction,
        })
    }

    pub async fn get_pending_queue_state(&self) -> Result<PendingQueueState> {
        let pending = self.get_features_by_status(FeatureStatus::Pending).await?;
        let now = Utc::now();

        let mut claimable_now = 0;
        let mut waiting_backoff = 0;
        let mut waiting_deps = 0;
        let mut earliest_next_attempt_at: Option<DateTime<Utc>> = None;
        let mut example_dep_blocked_feature = None;

        let dep_status = self.all_dependency_status().await?;

        for f in &pending {
            let deps_satisfied = dep_status
                .get(&f.id)
                .map(|deps| deps.iter().all(|s| s == "DONE"))
                .unwrap_or(true);

            let backoff_ready = f.next_attempt_at.map(|t| t <= now).unwrap_or(true);

            if !deps_satisfied {
                waiting_deps += 1;
                example_dep_blocked_feature.get_or_insert(f.id);
                continue;
            }

            if !backoff_ready {
                waiting_backoff += 1;
                if let Some(t) = f.next_attempt_at {
                    earliest_next_attempt_at = Some(match earliest_next_attempt_at {
                        Some(existing) if existing <= t => existing,
                        _ => t,
                    });
                }
                continue;
            }

            claimable_now += 1;
        }

        Ok(PendingQueueState {
            pending_total: pending.len() as i64,
            claimable_now,
            waiting_backoff,
            waiting_deps,
            earliest_next_attempt_at,
            example_dep_blocked_feature,
        })
    }

    async fn all_dependency_status(&self) -> Result<HashMap<i64, Vec<String>>> {
        let rows = sqlx::query(
            r#"
            SELECT d.feature_id, dep.status FROM feature_dependencies d
            JOIN features dep ON dep.id = d.depends_on_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut map: HashMap<i64, Vec<String>> = HashMap::new();
        for row in rows {
            let feature_id: i64 = row.try_get("feature_id")?;
            let status: String = row.try_get("status")?;
            map.entry(feature_id).or_default().push(status);
        }
        Ok(map)
    }
}

fn detect_cycle_members(graph: &HashMap<i64, Vec<i64>>) -> HashSet<i64> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    let mut marks: HashMap<i64, Mark> = HashMap::new();
    let mut members = HashSet::new();
    let mut stack: Vec<i64> = Vec::new();

    fn visit(
        node: i64,
        graph: &HashMap<i64, Vec<i64>>,
        marks: &mut HashMap<i64, Mark>,
        stack: &mut Vec<i64>,
        members: &mut HashSet<i64>,
    ) {
        if let Some(Mark::Done) = marks.get(&node) {
            return;
        }
        if let Some(Mark::Visiting) = marks.get(&node) {
            if let Some(pos) = stack.iter().position(|n| *n == node) {
                for n in &stack[pos..] {
                    members.insert(*n);
                }
            }
            return;
        }

        marks.insert(node, Mark::Visiting);
        stack.push(node);

        if let Some(neighbors) = graph.get(&node) {
            for &next in neighbors {
                visit(next, graph, marks, stack, members);
            }
        }

        stack.pop();
        marks.insert(node, Mark::Done);
    }

    for &node in graph.keys() {
        visit(node, graph, &mut marks, &mut stack, &mut members);
    }

    members
}

fn row_to_feature(row: sqlx::sqlite::SqliteRow) -> Result<Feature> {
    let steps_json: String = row.try_get("steps")?;
    let steps: Vec<String> = serde_json::from_str(&steps_json).unwrap_or_default();

    Ok(Feature {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        category: row.try_get("category")?,
        steps,
        priority: row.try_get("priority")?,
        status: row.try_get("status")?,
        passes: row.try_get::<i64, _>("passes")? != 0,
        review_status: row.try_get("review_status")?,
        assigned_agent_id: row.try_get("assigned_agent_id")?,
        assigned_at: parse_optional_ts(row.try_get("assigned_at")?),
        branch_name: row.try_get("branch_name")?,
        attempts: row.try_get("attempts")?,
        last_error: row.try_get("last_error")?,
        next_attempt_at: parse_optional_ts(row.try_get("next_attempt_at")?),
        last_error_key: row.try_get("last_error_key")?,
        same_error_streak: row.try_get("same_error_streak")?,
        last_artifact_path: row.try_get("last_artifact_path")?,
        last_diff_fingerprint: row.try_get("last_diff_fingerprint")?,
        same_diff_streak: row.try_get("same_diff_streak")?,
        qa_attempts: row.try_get("qa_attempts")?,
        last_blocked_reason: row.try_get("last_blocked_reason")?,
        created_at: parse_ts(row.try_get("created_at")?),
        updated_at: parse_ts(row.try_get("updated_at")?),
        completed_at: parse_optional_ts(row.try_get("completed_at")?),
    })
}

fn row_to_heartbeat(row: sqlx::sqlite::SqliteRow) -> Result<AgentHeartbeat> {
    Ok(AgentHeartbeat {
        agent_id: row.try_get("agent_id")?,
        last_ping: parse_ts(row.try_get("last_ping")?),
        status: row.try_get("status")?,
        worktree_path: row.try_get("worktree_path")?,
        feature_id: row.try_get("feature_id")?,
        pid: row.try_get("pid")?,
        started_at: parse_optional_ts(row.try_get("started_at")?),
        process_created_at: parse_optional_ts(row.try_get("process_created_at")?),
        api_port: row.try_get("api_port")?,
        web_port: row.try_get("web_port")?,
        log_file_path: row.try_get("log_file_path")?,
        start_ticks: row.try_get("start_ticks")?,
    })
}

fn parse_ts(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_optional_ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|d| d.with_timezone(&Utc))
}
