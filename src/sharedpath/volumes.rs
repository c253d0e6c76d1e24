/*
 * Copyright (C) 2026 The Sharedpath Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::{symlink, DirBuilderExt};
use std::path::{Path, PathBuf};

use crate::sharedpath::logger::{log_debug, log_info, log_warn};
use crate::sharedpath::store::{
    self, Catalog, VolumeRow,
};
use crate::sharedpath::types::VolumeCondition;
use crate::sharedpath::util::error::{new_error, with_context, DynResult};

pub const MIB: i64 = 1 << 20;
pub const GIB: i64 = 1 << 30;

const VOLUME_BASE: &str = "vols";
const SYMLINK_BASE: &str = "syms";
const DIR_MODE: u32 = 0o750;

const COMPONENT: &str = "volumes";

/// Rounds a requested capacity up to the next MiB with a 1 GiB floor.
pub fn fix_capacity(capacity: i64) -> i64 {
    let mut capacity = capacity.max(GIB);
    if capacity % MIB != 0 {
        capacity = ((capacity >> 20) + 1) << 20;
    }
    capacity
}

fn make_dir_all(path: &Path) -> std::io::Result<()> {
    fs::DirBuilder::new()
        .recursive(true)
        .mode(DIR_MODE)
        .create(path)
}

/// `<vols>/<id[0:2]>/<id[2:4]>/<id[4:6]>/<id>`: three one-byte shard
/// directories, then the id itself.
pub fn volume_shard_path(vols_path: &Path, vol_id: &str) -> DynResult<PathBuf> {
    let (a, b, c) = match (vol_id.get(0..2), vol_id.get(2..4), vol_id.get(4..6)) {
        (Some(a), Some(b), Some(c)) => (a, b, c),
        _ => {
            return Err(new_error(format!(
                "volume id '{vol_id}' is too short to shard"
            )))
        }
    };
    Ok(vols_path.join(a).join(b).join(c).join(vol_id))
}

/// Creates the backing artifact when missing. Returns `true` when it had to
/// populate, `false` when the artifact was already there.
pub fn populate_artifact(vol_path: &Path, is_block: bool, capacity: i64) -> DynResult<bool> {
    match fs::symlink_metadata(vol_path) {
        Ok(_) => Ok(false),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            if is_block {
                let file = OpenOptions::new()
                    .create_new(true)
                    .write(true)
                    .open(vol_path)
                    .map_err(|e| {
                        with_context(
                            e,
                            format!("Failed to create volume file {}", vol_path.display()),
                        )
                    })?;
                file.set_len(capacity as u64).map_err(|e| {
                    let _ = fs::remove_file(vol_path);
                    with_context(
                        e,
                        format!(
                            "Failed to size volume file {} to {} bytes",
                            vol_path.display(),
                            capacity
                        ),
                    )
                })?;
            } else {
                make_dir_all(vol_path).map_err(|e| {
                    with_context(
                        e,
                        format!("Failed to create volume directory {}", vol_path.display()),
                    )
                })?;
            }
            Ok(true)
        }
        Err(err) => Err(with_context(
            err,
            format!("Failed to stat volume artifact {}", vol_path.display()),
        )),
    }
}

/// Removes a backing artifact regardless of kind; a missing artifact is fine.
pub fn remove_artifact(vol_path: &Path) -> DynResult<()> {
    let metadata = match fs::symlink_metadata(vol_path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(err) => {
            return Err(with_context(
                err,
                format!("Failed to stat volume artifact {}", vol_path.display()),
            ))
        }
    };
    let result = if metadata.is_dir() {
        fs::remove_dir_all(vol_path)
    } else {
        fs::remove_file(vol_path)
    };
    match result {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(with_context(
            err,
            format!("Failed to remove volume artifact {}", vol_path.display()),
        )),
    }
}

fn ensure_symlink(syms_path: &Path, ns_name: &str, pvc_name: &str, target: &Path) -> DynResult<()> {
    let symlink_dir = syms_path.join(ns_name);
    make_dir_all(&symlink_dir).map_err(|e| {
        with_context(
            e,
            format!("Failed to create symlink directory {}", symlink_dir.display()),
        )
    })?;
    let symlink_file = symlink_dir.join(pvc_name);
    match symlink(target, &symlink_file) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(()),
        Err(err) => Err(with_context(
            err,
            format!(
                "Failed to create symlink {} -> {}",
                symlink_file.display(),
                target.display()
            ),
        )),
    }
}

fn remove_symlink(syms_path: &Path, ns_name: &str, pvc_name: &str) {
    let symlink_file = syms_path.join(ns_name).join(pvc_name);
    if let Err(err) = fs::remove_file(&symlink_file) {
        if err.kind() != ErrorKind::NotFound {
            log_warn(
                COMPONENT,
                "Failed to remove volume symlink",
                &[
                    ("path", &symlink_file.display().to_string()),
                    ("error", &err.to_string()),
                ],
            );
        }
    }
}

/// Health of one volume's backing artifact as reported in list/get replies.
pub fn volume_condition(vol: &VolumeRow) -> VolumeCondition {
    match fs::metadata(&vol.vol_path) {
        Err(err) => VolumeCondition::abnormal(err.to_string()),
        Ok(metadata) => {
            if vol.is_block && metadata.len() != vol.capacity as u64 {
                VolumeCondition::abnormal("file size mismatch")
            } else {
                VolumeCondition::ok()
            }
        }
    }
}

/// Owns the coupled lifecycle of catalog rows and on-disk backing artifacts
/// under the shared data root.
#[derive(Clone)]
pub struct VolumeManager {
    catalog: Catalog,
    vols_path: PathBuf,
    syms_path: PathBuf,
}

impl VolumeManager {
    pub fn new(data_root: &Path, catalog: Catalog) -> DynResult<Self> {
        let vols_path = data_root.join(VOLUME_BASE);
        make_dir_all(&vols_path).map_err(|e| {
            with_context(
                e,
                format!("Failed to create volumes root {}", vols_path.display()),
            )
        })?;
        let syms_path = data_root.join(SYMLINK_BASE);
        make_dir_all(&syms_path).map_err(|e| {
            with_context(
                e,
                format!("Failed to create symlinks root {}", syms_path.display()),
            )
        })?;
        Ok(Self {
            catalog,
            vols_path,
            syms_path,
        })
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Inserts the catalog row and populates the backing artifact inside one
    /// transaction window; commit failures reverse the filesystem work.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_volume(
        &self,
        vol_id: &str,
        vol_name: &str,
        pv_name: &str,
        pvc_name: &str,
        ns_name: &str,
        capacity: i64,
        is_block: bool,
    ) -> DynResult<VolumeRow> {
        let volume_path = volume_shard_path(&self.vols_path, vol_id)?;
        let prefix = volume_path
            .parent()
            .ok_or_else(|| new_error("volume path has no shard prefix"))?;
        make_dir_all(prefix).map_err(|e| {
            with_context(
                e,
                format!("Failed to create shard directories {}", prefix.display()),
            )
        })?;

        let vol_path_text = volume_path.display().to_string();
        let mut tx = self.catalog.begin().await?;
        let row = store::insert_volume_tx(
            &mut tx,
            vol_id,
            vol_name,
            pv_name,
            pvc_name,
            ns_name,
            capacity,
            is_block,
            &vol_path_text,
        )
        .await?;

        let populated = match populate_artifact(&volume_path, is_block, capacity) {
            Ok(populated) => populated,
            Err(err) => {
                let _ = tx.rollback().await;
                return Err(with_context(err, "Failed to populate volume artifact"));
            }
        };

        // Best-effort: a missing symlink is repaired by the rebuild job.
        if let Err(err) = ensure_symlink(&self.syms_path, ns_name, pvc_name, &volume_path) {
            log_warn(
                COMPONENT,
                "Failed to create volume symlink",
                &[("volume_id", vol_id), ("error", &err.to_string())],
            );
        }

        if let Err(err) = tx.commit().await {
            if populated {
                let _ = remove_artifact(&volume_path);
            }
            remove_symlink(&self.syms_path, ns_name, pvc_name);
            return Err(with_context(err, "Failed to commit volume creation"));
        }

        log_info(
            COMPONENT,
            "Volume created",
            &[
                ("volume_id", vol_id),
                ("namespace", ns_name),
                ("pvc", pvc_name),
            ],
        );
        Ok(row)
    }

    /// Soft-deletes the row and removes the artifact plus symlink; a missing
    /// artifact or symlink is not an error.
    pub async fn delete_volume(&self, vol: &VolumeRow) -> DynResult<()> {
        let mut tx = self.catalog.begin().await?;
        store::soft_delete_volume_tx(&mut tx, &vol.vol_id).await?;

        remove_symlink(&self.syms_path, &vol.ns_name, &vol.pvc_name);
        if let Err(err) = remove_artifact(Path::new(&vol.vol_path)) {
            let _ = tx.rollback().await;
            return Err(with_context(err, "Failed to remove volume artifact"));
        }

        tx.commit()
            .await
            .map_err(|e| with_context(e, "Failed to commit volume deletion"))?;
        log_info(
            COMPONENT,
            "Volume deleted",
            &[
                ("volume_id", &vol.vol_id),
                ("namespace", &vol.ns_name),
                ("pvc", &vol.pvc_name),
            ],
        );
        Ok(())
    }

    /// Grows the catalog capacity and, for block volumes, the sparse file.
    /// Returns the capacity in effect afterwards.
    pub async fn expand_volume(&self, vol: &VolumeRow, new_capacity: i64) -> DynResult<i64> {
        let new_capacity = fix_capacity(new_capacity);
        if new_capacity <= vol.capacity {
            return Ok(vol.capacity);
        }

        let mut tx = self.catalog.begin().await?;
        store::update_volume_capacity_tx(&mut tx, &vol.vol_id, new_capacity).await?;

        if vol.is_block {
            let metadata = match fs::metadata(&vol.vol_path) {
                Ok(metadata) => metadata,
                Err(err) => {
                    let _ = tx.rollback().await;
                    return Err(with_context(
                        err,
                        format!("Failed to stat volume file {}", vol.vol_path),
                    ));
                }
            };
            if metadata.len() != vol.capacity as u64 {
                let _ = tx.rollback().await;
                return Err(new_error(format!(
                    "file size mismatch: catalog {} bytes, disk {} bytes",
                    vol.capacity,
                    metadata.len()
                )));
            }

            let grow = OpenOptions::new()
                .write(true)
                .open(&vol.vol_path)
                .and_then(|file| file.set_len(new_capacity as u64));
            if let Err(err) = grow {
                let _ = tx.rollback().await;
                return Err(with_context(
                    err,
                    format!("Failed to grow volume file {}", vol.vol_path),
                ));
            }
        }

        tx.commit()
            .await
            .map_err(|e| with_context(e, "Failed to commit volume expansion"))?;
        log_info(
            COMPONENT,
            "Volume expanded",
            &[
                ("volume_id", &vol.vol_id),
                ("capacity", &new_capacity.to_string()),
            ],
        );
        Ok(new_capacity)
    }

    /// Idempotent artifact repair used by the create-volume idempotency path.
    pub fn populate_if_required(&self, vol: &VolumeRow) -> DynResult<bool> {
        let populated = populate_artifact(Path::new(&vol.vol_path), vol.is_block, vol.capacity)?;
        if populated {
            log_debug(
                COMPONENT,
                "Volume artifact repopulated",
                &[("volume_id", &vol.vol_id), ("path", &vol.vol_path)],
            );
        }
        Ok(populated)
    }

    /// Wipes and recreates the symlink tree from the live catalog rows.
    /// Individual failures are logged and the walk continues; the job
    /// returns an aggregate error at the end.
    pub async fn rebuild_symlinks(&self) -> DynResult<()> {
        match fs::remove_dir_all(&self.syms_path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                return Err(with_context(
                    err,
                    format!("Failed to remove symlinks root {}", self.syms_path.display()),
                ))
            }
        }
        make_dir_all(&self.syms_path).map_err(|e| {
            with_context(
                e,
                format!("Failed to recreate symlinks root {}", self.syms_path.display()),
            )
        })?;

        let vols = self.catalog.list_volumes(0, None).await?;
        let mut failures: usize = 0;
        for vol in &vols {
            if let Err(err) = ensure_symlink(
                &self.syms_path,
                &vol.ns_name,
                &vol.pvc_name,
                Path::new(&vol.vol_path),
            ) {
                failures += 1;
                log_warn(
                    COMPONENT,
                    "Failed to rebuild volume symlink",
                    &[("volume_id", &vol.vol_id), ("error", &err.to_string())],
                );
            }
        }

        if failures > 0 {
            return Err(new_error(format!(
                "failed to rebuild {failures} of {} symlinks",
                vols.len()
            )));
        }
        log_info(
            COMPONENT,
            "Symlinks rebuilt",
            &[("count", &vols.len().to_string())],
        );
        Ok(())
    }

    /// Reclaims artifacts for soft-deleted rows, sweeps catalog-less leaves
    /// under the volumes root, then rebuilds the symlink tree.
    pub async fn cleanup_dangling_volumes(&self) -> DynResult<()> {
        for vol in self.catalog.list_soft_deleted_volumes().await? {
            let vol_path = Path::new(&vol.vol_path);
            if let Err(err) = remove_artifact(vol_path) {
                log_warn(
                    COMPONENT,
                    "Failed to remove soft-deleted volume artifact",
                    &[("volume_id", &vol.vol_id), ("error", &err.to_string())],
                );
                continue;
            }
            self.catalog.purge_volume(&vol.vol_id).await?;
            log_debug(
                COMPONENT,
                "Soft-deleted volume purged",
                &[("volume_id", &vol.vol_id)],
            );
        }

        for leaf in shard_leaves(&self.vols_path)? {
            let leaf_text = leaf.display().to_string();
            if self
                .catalog
                .find_live_volume_by_path(&leaf_text)
                .await?
                .is_none()
            {
                if let Err(err) = remove_artifact(&leaf) {
                    log_warn(
                        COMPONENT,
                        "Failed to remove dangling volume artifact",
                        &[("path", &leaf_text), ("error", &err.to_string())],
                    );
                } else {
                    log_info(
                        COMPONENT,
                        "Dangling volume artifact removed",
                        &[("path", &leaf_text)],
                    );
                }
            }
        }

        self.rebuild_symlinks().await
    }
}

/// All `vols/*/*/*/*` leaves: every artifact under the three shard levels.
fn shard_leaves(vols_path: &Path) -> DynResult<Vec<PathBuf>> {
    let mut leaves = Vec::new();
    let mut level: Vec<PathBuf> = vec![vols_path.to_path_buf()];
    for depth in 0..4 {
        let mut next = Vec::new();
        for dir in &level {
            let entries = match fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => {
                    return Err(with_context(
                        err,
                        format!("Failed to read volumes directory {}", dir.display()),
                    ))
                }
            };
            for entry in entries {
                let entry = entry.map_err(|e| {
                    with_context(
                        e,
                        format!("Failed to iterate volumes directory {}", dir.display()),
                    )
                })?;
                next.push(entry.path());
            }
        }
        if depth == 3 {
            leaves = next;
            break;
        }
        level = next;
    }
    Ok(leaves)
}
