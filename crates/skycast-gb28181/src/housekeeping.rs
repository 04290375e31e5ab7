// 周期维护
// 过期设备下线、INVITE 超时失败、nonce 清理

use crate::error::{Gb28181Error, Result};
use crate::repository::{DeviceQuery, DeviceStatus, EventRecord, SessionStatus};
use crate::service::ServiceCore;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 设备分页大小
const DEVICE_PAGE_SIZE: usize = 200;

/// 单次扫描的 INVITE 会话上限
const INVITING_SCAN_LIMIT: usize = 1000;

/// 单次维护的时限
const SWEEP_DEADLINE: Duration = Duration::from_secs(5);

/// 设备最短存活时间（秒）
const MIN_DEVICE_TTL_SECS: i64 = 30;

/// 单次维护结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub devices_offline: usize,
    pub sessions_failed: usize,
    pub nonces_expired: usize,
}

impl ServiceCore {
    pub(crate) fn spawn_housekeeping(
        self: &Arc<Self>,
        mut signal: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let core = self.clone();
        tokio::spawn(async move {
            let period = core.config().housekeeping_period();
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match tokio::time::timeout(SWEEP_DEADLINE, core.run_housekeeping_once()).await {
                            Ok(Ok(report)) => {
                                if report != SweepReport::default() {
                                    info!(
                                        target: "gb28181::housekeeping",
                                        devices_offline = report.devices_offline,
                                        sessions_failed = report.sessions_failed,
                                        nonces_expired = report.nonces_expired,
                                        "Housekeeping sweep"
                                    );
                                }
                            }
                            Ok(Err(e)) => {
                                debug!(target: "gb28181::housekeeping", "Housekeeping finished with errors: {}", e);
                            }
                            Err(_) => {
                                warn!(target: "gb28181::housekeeping", "Housekeeping timed out");
                                core.record_error(format!("housekeeping: {}", Gb28181Error::Timeout));
                            }
                        }
                    }
                    changed = signal.changed() => {
                        if changed.is_err() || *signal.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!(target: "gb28181::housekeeping", "Housekeeping loop exited");
        })
    }

    pub(crate) async fn run_housekeeping_once(&self) -> Result<SweepReport> {
        self.sweep_at(Utc::now()).await
    }

    /// 以给定时间执行一次维护
    ///
    /// 各步骤互不影响，某步失败时记录错误并继续，全部执行完后返回首个错误。
    pub(crate) async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let mut first_err = None;

        match self.sweep_stale_devices(now).await {
            Ok(n) => report.devices_offline = n,
            Err(e) => self.note_step_failure("devices", e, &mut first_err),
        }
        match self.sweep_timed_out_invites(now).await {
            Ok(n) => report.sessions_failed = n,
            Err(e) => self.note_step_failure("invites", e, &mut first_err),
        }
        report.nonces_expired = self.nonces.sweep_at(now);

        match first_err {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    fn note_step_failure(
        &self,
        step: &str,
        err: Gb28181Error,
        first_err: &mut Option<Gb28181Error>,
    ) {
        warn!(target: "gb28181::housekeeping", step, "Housekeeping step failed: {}", err);
        self.record_error(format!("housekeeping {}: {}", step, err));
        first_err.get_or_insert(err);
    }

    async fn sweep_stale_devices(&self, now: DateTime<Utc>) -> Result<usize> {
        let cfg = self.config();
        let floor = [
            i64::from(cfg.register_expires),
            3 * i64::from(cfg.heartbeat_interval),
            MIN_DEVICE_TTL_SECS,
        ]
        .into_iter()
        .max()
        .unwrap_or(MIN_DEVICE_TTL_SECS);

        let mut stale = Vec::new();
        let mut offset = 0;
        loop {
            let page = self
                .repo
                .list_devices(&DeviceQuery {
                    status: Some(DeviceStatus::Online),
                    offset,
                    limit: DEVICE_PAGE_SIZE,
                })
                .await?;
            let page_len = page.len();

            for device in page {
                let ttl = floor.max(i64::from(device.expires));
                if (now - device.last_seen()).num_seconds() > ttl {
                    stale.push(device.device_id);
                }
            }

            if page_len < DEVICE_PAGE_SIZE {
                break;
            }
            offset += page_len;
        }

        if stale.is_empty() {
            return Ok(0);
        }

        self.repo
            .update_device_status(&stale, DeviceStatus::Offline)
            .await?;
        for device_id in &stale {
            info!(target: "gb28181::housekeeping", %device_id, "Device marked offline");
            self.record_event(EventRecord::new("offline", device_id)).await;
        }
        Ok(stale.len())
    }

    async fn sweep_timed_out_invites(&self, now: DateTime<Utc>) -> Result<usize> {
        let timeout = self.config().ack_timeout();
        let cutoff = now - ChronoDuration::seconds(timeout.as_secs() as i64);

        let sessions = self
            .repo
            .list_sessions(Some(SessionStatus::Inviting), INVITING_SCAN_LIMIT)
            .await?;

        let mut failed = 0;
        for mut session in sessions {
            if session.status != SessionStatus::Inviting || session.updated_at >= cutoff {
                continue;
            }
            let call_id = session.call_id.clone();
            let device_id = session.device_id.clone();
            session.status = SessionStatus::Failed;
            session.updated_at = now;
            self.repo.upsert_session(session).await?;
            self.ports.release(&call_id);
            failed += 1;

            warn!(target: "gb28181::housekeeping", %call_id, "INVITE timed out");
            self.record_event(
                EventRecord::new("session_timeout", device_id).with_call_id(&call_id),
            )
            .await;
        }
        Ok(failed)
    }
}
