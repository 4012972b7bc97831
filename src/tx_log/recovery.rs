use std::{
    collections::HashMap,
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

use log::{debug, info};

use crate::{
    btree::{buffer_pool::BufferPool, table::TableManager},
    error::SmallError,
    tx_log::{
        record::{LogBody, UpdateImage},
        LogManager,
    },
    types::{Lsn, SmallResult, XactId},
};

/// Crash injection for recovery testing: stop the named pass after
/// `log_num` records and leave the log as it is.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RecoveryMode {
    Normal,
    RedoCrash,
    UndoCrash,
}

#[derive(Debug, PartialEq)]
pub enum RecoveryOutcome {
    Completed,
    Crashed,
}

/// The three-pass restart protocol. Runs once at open when the log holds
/// records, writing one trace line per record touched so the outcome can
/// be checked from the outside.
pub struct Recovery<'a> {
    log_manager: &'a LogManager,
    pool: &'a BufferPool,
    table_manager: &'a TableManager,
    trace: BufWriter<File>,
    mode: RecoveryMode,
    log_num: usize,
}

impl<'a> Recovery<'a> {
    pub fn new<P: AsRef<Path>>(
        log_manager: &'a LogManager,
        pool: &'a BufferPool,
        table_manager: &'a TableManager,
        logmsg_path: P,
        mode: RecoveryMode,
        log_num: usize,
    ) -> Result<Self, SmallError> {
        let trace = BufWriter::new(File::create(logmsg_path).map_err(SmallError::io)?);
        Ok(Self {
            log_manager,
            pool,
            table_manager,
            trace,
            mode,
            log_num,
        })
    }

    pub fn run(&mut self) -> Result<RecoveryOutcome, SmallError> {
        info!("recovery starts");

        let losers = self.analysis()?;

        if self.redo()? == RecoveryOutcome::Crashed {
            self.trace.flush().map_err(SmallError::io)?;
            return Ok(RecoveryOutcome::Crashed);
        }

        if self.undo(losers)? == RecoveryOutcome::Crashed {
            self.trace.flush().map_err(SmallError::io)?;
            return Ok(RecoveryOutcome::Crashed);
        }

        // the database is consistent again; the log has served its purpose
        self.pool.flush_all()?;
        self.log_manager.force()?;
        self.log_manager.truncate()?;
        self.trace.flush().map_err(SmallError::io)?;

        info!("recovery complete");
        Ok(RecoveryOutcome::Completed)
    }

    /// Forward scan classifying transactions into winners (terminated)
    /// and losers, remembering each loser's most recent LSN. Tables named
    /// by update records are opened on demand.
    fn analysis(&mut self) -> Result<HashMap<XactId, Lsn>, SmallError> {
        self.line("[ANALYSIS] Analysis pass start")?;

        let next_lsn = self.log_manager.next_lsn();
        let mut ended: HashMap<XactId, bool> = HashMap::new();
        let mut last_lsn: HashMap<XactId, Lsn> = HashMap::new();

        let mut lsn = self.log_manager.base_lsn();
        while lsn < next_lsn {
            let record = self.log_manager.read_record(lsn)?;

            match &record.body {
                LogBody::Begin => {
                    ended.insert(record.xid, false);
                    last_lsn.insert(record.xid, record.lsn);
                }
                LogBody::Commit | LogBody::Rollback => {
                    ended.insert(record.xid, true);
                }
                LogBody::Update(image) | LogBody::Compensate { image, .. } => {
                    ended.entry(record.xid).or_insert(false);
                    last_lsn.insert(record.xid, record.lsn);
                    self.table_manager
                        .open_table(&format!("DATA{}", image.table_id))?;
                }
            }

            lsn = record.end_lsn();
        }

        let mut winners: Vec<XactId> = Vec::new();
        let mut losers: Vec<XactId> = Vec::new();
        for (&xid, &is_ended) in ended.iter() {
            if is_ended {
                winners.push(xid);
            } else {
                losers.push(xid);
            }
        }
        winners.sort();
        losers.sort();

        let mut summary = String::from("[ANALYSIS] Analysis success. Winner:");
        for xid in winners.iter() {
            summary.push_str(&format!(" {}", xid));
        }
        summary.push_str(", Loser:");
        for xid in losers.iter() {
            summary.push_str(&format!(" {}", xid));
        }
        self.line(&summary)?;

        debug!("analysis: winners {:?}, losers {:?}", winners, losers);

        Ok(losers
            .into_iter()
            .map(|xid| (xid, last_lsn[&xid]))
            .collect())
    }

    /// Forward scan repeating history: every UPDATE/CLR whose page has
    /// not seen it yet (page_lsn < lsn) is applied and the page restamped.
    fn redo(&mut self) -> Result<RecoveryOutcome, SmallError> {
        self.line("[REDO] Redo pass start")?;

        let next_lsn = self.log_manager.next_lsn();
        let mut consumed = 0usize;

        let mut lsn = self.log_manager.base_lsn();
        while lsn < next_lsn {
            if self.mode == RecoveryMode::RedoCrash && consumed == self.log_num {
                debug!("redo crash injected after {} records", consumed);
                return Ok(RecoveryOutcome::Crashed);
            }

            let record = self.log_manager.read_record(lsn)?;

            match &record.body {
                LogBody::Begin | LogBody::Commit | LogBody::Rollback => {
                    let line = record.to_string();
                    self.line(&line)?;
                }
                LogBody::Update(image) | LogBody::Compensate { image, .. } => {
                    let applied = {
                        let page = self.pool.get_page(image.table_id, image.pagenum)?;
                        let mut buf = page.write();

                        if buf.page.page_lsn() < record.lsn {
                            buf.page
                                .write_bytes(image.offset as usize, image.new_data());
                            buf.page.set_page_lsn(record.lsn);
                            buf.mark_dirty();
                            true
                        } else {
                            false
                        }
                    };

                    let line = if !applied {
                        format!(
                            "LSN {} [CONSIDER-REDO] Transaction id {}",
                            record.end_lsn(),
                            record.xid
                        )
                    } else if let LogBody::Update(_) = record.body {
                        format!("{} redo apply", record)
                    } else {
                        record.to_string()
                    };
                    self.line(&line)?;
                }
            }

            consumed += 1;
            lsn = record.end_lsn();
        }

        self.line("[REDO] Redo pass end")?;
        Ok(RecoveryOutcome::Completed)
    }

    /// Roll the losers back, always taking the loser with the greatest
    /// outstanding LSN. Each undone UPDATE leaves a CLR behind; a BEGIN
    /// closes the loser with a ROLLBACK record.
    fn undo(&mut self, losers: HashMap<XactId, Lsn>) -> Result<RecoveryOutcome, SmallError> {
        self.line("[UNDO] Undo pass start")?;

        let mut cursors = losers;
        let mut consumed = 0usize;

        while !cursors.is_empty() {
            if self.mode == RecoveryMode::UndoCrash && consumed == self.log_num {
                debug!("undo crash injected after {} records", consumed);
                return Ok(RecoveryOutcome::Crashed);
            }

            let (xid, lsn) = {
                let (&xid, &lsn) = cursors.iter().max_by_key(|(_, &lsn)| lsn).unwrap();
                (xid, lsn)
            };
            let record = self.log_manager.read_record(lsn)?;

            match &record.body {
                LogBody::Compensate { next_undo_lsn, .. } => {
                    // already compensated earlier; just follow the chain
                    let line = record.to_string();
                    self.line(&line)?;
                    cursors.insert(xid, *next_undo_lsn);
                }
                LogBody::Update(image) => {
                    let clr = self.log_manager.append_raw(
                        xid,
                        record.lsn,
                        LogBody::Compensate {
                            image: swap_image(image),
                            next_undo_lsn: record.prev_lsn,
                        },
                    );

                    let page = self.pool.get_page(image.table_id, image.pagenum)?;
                    let mut buf = page.write();
                    if buf.page.page_lsn() >= record.lsn {
                        buf.page
                            .write_bytes(image.offset as usize, image.old_data());
                        buf.page.set_page_lsn(clr.lsn);
                        buf.mark_dirty();

                        let line = format!("{} undo apply", record);
                        self.line(&line)?;
                    }

                    cursors.insert(xid, record.prev_lsn);
                }
                LogBody::Begin => {
                    let rollback = self.log_manager.append_raw(xid, record.lsn, LogBody::Rollback);
                    let line = rollback.to_string();
                    self.line(&line)?;
                    cursors.remove(&xid);
                }
                LogBody::Commit | LogBody::Rollback => {
                    return Err(SmallError::Invariant(format!(
                        "undo cursor of xact {} landed on a terminal record",
                        xid
                    )));
                }
            }

            consumed += 1;
        }

        self.line("[UNDO] Undo pass end")?;
        Ok(RecoveryOutcome::Completed)
    }

    fn line(&mut self, text: &str) -> SmallResult {
        writeln!(self.trace, "{}", text).map_err(SmallError::io)
    }
}

/// The CLR's images are the update's, swapped: redoing the CLR restores
/// the pre-update value.
fn swap_image(image: &UpdateImage) -> UpdateImage {
    let mut swapped = image.clone();
    std::mem::swap(&mut swapped.old_image, &mut swapped.new_image);
    swapped
}
