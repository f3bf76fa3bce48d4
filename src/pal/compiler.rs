//! Job compiler: resolves micro-operations against the archive.
//!
//! [`JobCompiler::precheck`] walks every micro-operation of a plan, resolves
//! source and destination for each repetition and emits the vendor job list.
//! Resolution decides the sample custody of the run (which samples are
//! consumed, diluted, created or incorporated into an assembly) but writes
//! nothing to the archive. [`JobCompiler::commit_action`] does the archive
//! bookkeeping once the hardware acknowledged the run.
//!
//! Destination outcomes:
//!
//! | destination holds           | result                                         |
//! |-----------------------------|------------------------------------------------|
//! | nothing                     | new reference sample, `receive_only`/`created` |
//! | same-type sample            | dilution of the held sample                    |
//! | assembly with matching part | dilution of that part                          |
//! | assembly without it         | new part appended to the assembly              |
//! | different-type sample       | new assembly (if the position allows it)       |
//!
//! Later repetitions of a plan see the destination contents decided by
//! earlier ones, so a second dispense into a vial the first one filled is a
//! dilution of the new sample, not another creation.

use crate::archive::PositionArchive;
use crate::config::PalConfig;
use crate::error::{AppResult, WorkcellError};
use crate::pal::plan::{ActionIndex, JobEntry, JobPlan, MicroOperation, PalAction};
use crate::position::{Position, RequestedPosition, ResolvedPosition};
use crate::sample::{Inheritance, Sample, SampleStatus, SampleType};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{debug, info};
use uuid::Uuid;

/// Actions compiled for one run of a plan, in execution order.
#[derive(Debug, Clone, Default)]
pub struct CompiledRun {
    /// Actions of this run in execution order
    pub actions: Vec<ActionIndex>,
}

/// Resolves plans against one archive with one method table.
pub struct JobCompiler<'a> {
    archive: &'a dyn PositionArchive,
    config: &'a PalConfig,
    /// Position contents decided by repetitions compiled so far
    planned: Mutex<BTreeMap<Position, Vec<Sample>>>,
}

impl<'a> JobCompiler<'a> {
    /// Compiler over `archive` using the method table of `config`.
    pub fn new(archive: &'a dyn PositionArchive, config: &'a PalConfig) -> Self {
        Self {
            archive,
            config,
            planned: Mutex::new(BTreeMap::new()),
        }
    }

    /// Planned contents of `position`, falling back to the archive.
    async fn held_at(&self, position: &Position) -> AppResult<Vec<Sample>> {
        let planned = self.planned.lock().get(position).cloned();
        match planned {
            Some(held) => Ok(held),
            None => self.archive.samples_at(position).await,
        }
    }

    fn plan_contents(&self, position: &Position, samples: &[Sample]) {
        let kept = samples
            .iter()
            .filter(|s| !s.has_status(SampleStatus::Destroyed))
            .cloned()
            .collect();
        self.planned.lock().insert(position.clone(), kept);
    }

    /// Resolve every repetition of every micro-operation and fill
    /// `plan.joblist`. On error, actions added by this call are removed again.
    pub async fn precheck(&self, plan: &mut JobPlan, logfile: &Path) -> AppResult<CompiledRun> {
        let marks: Vec<usize> = plan.micro_ops.iter().map(|op| op.runs.len()).collect();
        match self.compile(plan, logfile).await {
            Ok(compiled) => Ok(compiled),
            Err(e) => {
                for (op, mark) in plan.micro_ops.iter_mut().zip(marks) {
                    op.runs.truncate(mark);
                }
                Err(e)
            }
        }
    }

    async fn compile(&self, plan: &mut JobPlan, logfile: &Path) -> AppResult<CompiledRun> {
        let mut joblist = Vec::new();
        let mut compiled = CompiledRun::default();
        self.planned.lock().clear();

        for (op_index, op) in plan.micro_ops.iter_mut().enumerate() {
            let method_file = self.config.method_file(op.method)?;
            for _ in 0..=op.repeat {
                let mut action = self.check_source(op).await?;
                self.check_dest(op, &mut action).await?;
                let dest = action
                    .dest
                    .as_ref()
                    .ok_or_else(|| WorkcellError::Bug("action has no destination".to_string()))?;
                self.plan_contents(&dest.position, &dest.samples_final);
                let dest = dest.position.clone();

                joblist.push(JobEntry::encode(
                    &method_file,
                    op,
                    &action.source.position,
                    &dest,
                    logfile,
                ));
                debug!(
                    "compiled {} {} uL: {} -> {}",
                    op.method, op.volume_ul, action.source.position, dest
                );
                op.runs.push(action);
                compiled.actions.push(ActionIndex {
                    op: op_index,
                    run: op.runs.len() - 1,
                });
            }
        }

        info!(
            "plan {}: compiled {} job(s)",
            plan.uuid,
            compiled.actions.len()
        );
        plan.joblist = joblist;
        Ok(compiled)
    }

    /// Resolve the source of one repetition and start its action record.
    pub async fn check_source(&self, op: &mut MicroOperation) -> AppResult<PalAction> {
        let position = match &op.requested_source {
            RequestedPosition::Tray(t) => Position::Tray(*t),
            RequestedPosition::Custom(name) => Position::Custom(name.clone()),
            RequestedPosition::NextEmptyVial { .. } => {
                return Err(WorkcellError::NotAvailable(
                    "an empty vial cannot be a source".to_string(),
                ))
            }
            RequestedPosition::NextFullVial { after } => {
                let found = self.archive.find_next_occupied(*after).await?.ok_or_else(|| {
                    WorkcellError::NotAvailable("no occupied vial left in the trays".to_string())
                })?;
                op.requested_source.advance_anchor(found);
                Position::Tray(found)
            }
        };
        position.validate()?;

        let held = self.held_at(&position).await?;
        let sample = single_sample(&position, &held)?.ok_or_else(|| {
            WorkcellError::NotAvailable(format!("{} holds no sample", position))
        })?;

        let transfer_type = op.transfer_type.unwrap_or(if sample.is_assembly() {
            SampleType::Liquid
        } else {
            sample.kind
        });

        let mut action = PalAction::new(op, ResolvedPosition::new(position, held.clone()));
        action.push_input(
            sample.with_custody(None, &[]),
            -op.volume_ml(),
            false,
            transfer_type,
        );
        Ok(action)
    }

    /// Resolve the destination and decide the custody outcome.
    pub async fn check_dest(&self, op: &mut MicroOperation, action: &mut PalAction) -> AppResult<()> {
        if action.samples_in.len() != 1 {
            return Err(WorkcellError::Bug(format!(
                "destination resolution expects exactly one input, found {}",
                action.samples_in.len()
            )));
        }
        let source_sample = action.samples_in[0].clone();
        let transfer_type = action.dilute_type[0];
        let volume_ml = op.volume_ml();

        let position = match &op.requested_dest {
            RequestedPosition::Tray(t) => Position::Tray(*t),
            RequestedPosition::Custom(name) => Position::Custom(name.clone()),
            RequestedPosition::NextEmptyVial { after } => {
                let found = self
                    .archive
                    .find_next_free(volume_ml, *after)
                    .await?
                    .ok_or_else(|| {
                        WorkcellError::NotAvailable(format!(
                            "no empty vial for {} mL left in the trays",
                            volume_ml
                        ))
                    })?;
                op.requested_dest.advance_anchor(found);
                Position::Tray(found)
            }
            RequestedPosition::NextFullVial { after } => {
                let found = self.archive.find_next_occupied(*after).await?.ok_or_else(|| {
                    WorkcellError::NotAvailable("no occupied vial left in the trays".to_string())
                })?;
                op.requested_dest.advance_anchor(found);
                Position::Tray(found)
            }
        };
        position.validate()?;

        if !self.archive.is_dest_allowed(&position).await? {
            return Err(WorkcellError::NotAllowed(format!(
                "{} does not accept liquid",
                position
            )));
        }

        let held = self.held_at(&position).await?;
        let mut finals = match single_sample(&position, &held)? {
            None => {
                let created = self
                    .new_part(&source_sample, transfer_type, volume_ml, &position, action.uuid)
                    .await?
                    .into_iter()
                    .map(|s| s.with_custody(Some(Inheritance::ReceiveOnly), &[SampleStatus::Created]))
                    .collect::<Vec<_>>();
                action.samples_out.extend(created.iter().cloned());
                created
            }
            Some(existing) if existing.is_assembly() => {
                if existing.part_of_type(transfer_type).is_some() {
                    let diluted = existing.with_custody(
                        Some(Inheritance::ReceiveOnly),
                        &[SampleStatus::Preserved],
                    );
                    action.push_input(diluted.clone(), volume_ml, true, transfer_type);
                    vec![diluted]
                } else {
                    let parts = self
                        .new_part(&source_sample, transfer_type, volume_ml, &position, action.uuid)
                        .await?
                        .into_iter()
                        .map(|s| {
                            s.with_custody(
                                Some(Inheritance::AllowBoth),
                                &[SampleStatus::Created, SampleStatus::Incorporated],
                            )
                        })
                        .collect::<Vec<_>>();
                    let mut assembly = existing
                        .with_custody(Some(Inheritance::AllowBoth), &[SampleStatus::Preserved]);
                    assembly.parts.extend(parts.iter().cloned());
                    action.push_input(assembly.clone(), 0.0, false, transfer_type);
                    action.samples_out.extend(parts);
                    vec![assembly]
                }
            }
            Some(existing) if existing.kind == transfer_type => {
                let diluted = existing
                    .with_custody(Some(Inheritance::ReceiveOnly), &[SampleStatus::Preserved]);
                action.push_input(diluted.clone(), volume_ml, true, transfer_type);
                vec![diluted]
            }
            Some(existing) => {
                if !self.archive.is_assembly_allowed(&position).await? {
                    return Err(WorkcellError::NotAllowed(format!(
                        "{} holds {} and does not allow assemblies",
                        position, existing.kind
                    )));
                }
                let held_part = existing.with_custody(
                    Some(Inheritance::AllowBoth),
                    &[SampleStatus::Incorporated],
                );
                let mut parts = vec![held_part.clone()];
                for part in self
                    .new_part(&source_sample, transfer_type, volume_ml, &position, action.uuid)
                    .await?
                {
                    parts.push(part.with_custody(
                        Some(Inheritance::AllowBoth),
                        &[SampleStatus::Created, SampleStatus::Incorporated],
                    ));
                }
                let assembly = Sample::assembly(parts.clone())
                    .derived_from(&[&held_part, &source_sample], action.uuid)
                    .with_custody(Some(Inheritance::ReceiveOnly), &[SampleStatus::Created]);

                action.push_input(held_part, 0.0, false, transfer_type);
                action.samples_out.extend(parts.into_iter().skip(1));
                action.samples_out.push(assembly.clone());
                vec![assembly]
            }
        };

        if self.archive.is_destroying_position(&position).await? {
            for sample in action.samples_out.iter_mut().chain(finals.iter_mut()) {
                sample.push_status(SampleStatus::Destroyed);
            }
        }

        for sample in action.samples_in.iter_mut().filter(|s| s.inheritance.is_none()) {
            *sample = sample.with_custody(Some(Inheritance::GiveOnly), &[SampleStatus::Preserved]);
        }

        let mut dest = ResolvedPosition::new(position, held);
        dest.samples_final = finals;
        action.dest = Some(dest);
        Ok(())
    }

    async fn new_part(
        &self,
        source_sample: &Sample,
        kind: SampleType,
        volume_ml: f64,
        position: &Position,
        action_uuid: Uuid,
    ) -> AppResult<Vec<Sample>> {
        let created = self
            .archive
            .create_reference_samples(
                std::slice::from_ref(source_sample),
                kind,
                Some(volume_ml),
                position,
                action_uuid,
            )
            .await?;
        if created.is_empty() {
            return Err(WorkcellError::Archive(format!(
                "archive created no sample at {}",
                position
            )));
        }
        Ok(created)
    }

    /// Archive bookkeeping for one acknowledged action.
    pub async fn commit_action(
        &self,
        plan: &mut JobPlan,
        index: ActionIndex,
        at: DateTime<Utc>,
    ) -> AppResult<()> {
        let mut action = plan
            .action(index)
            .cloned()
            .ok_or_else(|| WorkcellError::Bug(format!("no action at {:?}", index)))?;
        if action.committed {
            return Err(WorkcellError::Bug(format!(
                "action {} committed twice",
                action.uuid
            )));
        }
        let aligned = action.samples_in.len();
        if [
            action.delta_volume_ml.len(),
            action.dilute.len(),
            action.dilute_type.len(),
        ]
        .iter()
        .any(|len| *len != aligned)
        {
            return Err(WorkcellError::Bug(format!(
                "action {} input bookkeeping is misaligned",
                action.uuid
            )));
        }
        let dest_position = action
            .dest
            .as_ref()
            .map(|d| d.position.clone())
            .ok_or_else(|| WorkcellError::Bug("action has no destination".to_string()))?;

        // refresh from the archive, keeping the custody decided at compile time
        let refreshed = self.archive.get_samples(&action.samples_in).await?;
        let inputs: Vec<Sample> = refreshed
            .into_iter()
            .zip(&action.samples_in)
            .map(|(fresh, compiled)| merge_compiled(fresh, compiled))
            .collect();
        action.source.samples_initial = self.archive.get_samples(&action.source.samples_initial).await?;
        if let Some(dest) = action.dest.as_mut() {
            dest.samples_initial = self.archive.get_samples(&dest.samples_initial).await?;
        }

        let mut outputs = action.samples_out.clone();
        for sample in &mut outputs {
            sample.stamp_created(at);
        }
        let committed_out = self.archive.commit_new_samples(&outputs).await?;

        let mut latest = Latest::default();
        for sample in &committed_out {
            latest.insert(sample);
        }

        plan.samples_in.extend(inputs.iter().cloned());
        plan.samples_out.extend(committed_out.iter().cloned());

        let mut updated = Vec::with_capacity(inputs.len());
        for (i, input) in inputs.iter().enumerate() {
            let resolved = latest.resolve(input);
            updated.push(resolved.with_volume_delta(
                action.delta_volume_ml[i],
                action.dilute[i],
                action.dilute_type[i],
            ));
        }
        self.archive.update_samples(&updated).await?;
        for sample in &updated {
            latest.insert(sample);
        }

        let mut assemblies: Vec<Sample> = Vec::new();
        for out in committed_out.iter().filter(|s| s.is_assembly()) {
            let mut assembly = latest.resolve(out);
            assembly.parts = self.archive.get_samples(&assembly.parts).await?;
            assemblies.push(assembly);
        }
        if !assemblies.is_empty() {
            self.archive.update_samples(&assemblies).await?;
            for sample in &assemblies {
                latest.insert(sample);
            }
        }

        let source_final: Vec<Sample> = action
            .source
            .samples_initial
            .iter()
            .map(|s| latest.resolve(s))
            .collect();
        let dest_final: Vec<Sample> = action
            .dest
            .as_ref()
            .map(|d| {
                d.samples_final
                    .iter()
                    .map(|compiled| merge_status(latest.resolve(compiled), compiled))
                    .collect()
            })
            .unwrap_or_default();

        if action.source.position != dest_position
            && !self
                .archive
                .update_position(&action.source.position, &source_final)
                .await?
        {
            return Err(WorkcellError::NotAvailable(format!(
                "archive refused the update of {}",
                action.source.position
            )));
        }
        if !self.archive.update_position(&dest_position, &dest_final).await? {
            return Err(WorkcellError::NotAvailable(format!(
                "archive refused the update of {}",
                dest_position
            )));
        }

        action.samples_in = inputs;
        action.samples_out = committed_out;
        action.source.samples_final = source_final;
        if let Some(dest) = action.dest.as_mut() {
            dest.samples_final = dest_final;
        }
        action.committed = true;

        let slot = plan
            .micro_ops
            .get_mut(index.op)
            .and_then(|op| op.runs.get_mut(index.run))
            .ok_or_else(|| WorkcellError::Bug(format!("no action at {:?}", index)))?;
        *slot = action;
        Ok(())
    }
}

/// Exactly zero or one sample per position; more is an archive violation.
fn single_sample(position: &Position, held: &[Sample]) -> AppResult<Option<Sample>> {
    match held {
        [] => Ok(None),
        [one] => Ok(Some(one.clone())),
        many => Err(WorkcellError::Archive(format!(
            "{} holds {} samples",
            position,
            many.len()
        ))),
    }
}

/// Archived state with the compile-time custody and any parts that only
/// exist in the compiled snapshot.
fn merge_compiled(fresh: Sample, compiled: &Sample) -> Sample {
    let mut merged = fresh.with_custody(compiled.inheritance, &compiled.status);
    for part in &compiled.parts {
        if !merged.parts.iter().any(|p| p.uuid == part.uuid) {
            merged.parts.push(part.clone());
        }
    }
    merged
}

fn merge_status(mut sample: Sample, compiled: &Sample) -> Sample {
    for status in &compiled.status {
        sample.push_status(*status);
    }
    if sample.inheritance.is_none() {
        sample.inheritance = compiled.inheritance;
    }
    sample
}

/// Newest known snapshot per sample uuid.
#[derive(Default)]
struct Latest {
    by_uuid: HashMap<Uuid, Sample>,
}

impl Latest {
    fn insert(&mut self, sample: &Sample) {
        for part in &sample.parts {
            self.insert(part);
        }
        self.by_uuid.insert(sample.uuid, sample.clone());
    }

    fn resolve(&self, sample: &Sample) -> Sample {
        let mut resolved = self
            .by_uuid
            .get(&sample.uuid)
            .cloned()
            .unwrap_or_else(|| sample.clone());
        resolved.parts = resolved.parts.iter().map(|p| self.resolve(p)).collect();
        resolved
    }
}
