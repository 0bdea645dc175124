//! Job colectivo de prueba: reparte las instancias de un vértice `source` y uno
//! `sink` sobre contenedores lógicos, arma un `Communicator` por contenedor sobre
//! el mismo fabric y los progresa a todos desde un único hilo.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use common::{
    ContainerId, IdAllocator, RoundRobinScheduler, SchedulerConfig, TaskId, TaskVertex, WorkerPlan,
};
use comms::{
    CollectingSink, CommsConfig, CommsResult, Communicator, DataType, Delivery, EdgeId, KeyValue,
    LocalChannel, LocalFabric, Mode, OperationBuilder, OperationKind, OperationSpec, ReduceOp,
    SinkEvent, Value,
};
use tracing::{debug, info};

const SOURCE: &str = "source";
const SINK: &str = "sink";

#[derive(Debug, Clone)]
pub struct JobConfig {
    pub operation: OperationKind,
    pub sources: u32,
    pub sinks: u32,
    pub iterations: u32,
    pub mode: Mode,
    pub deadline: Duration,
}

#[derive(Debug, Clone)]
pub struct JobReport {
    pub operation: OperationKind,
    pub containers: usize,
    /// Tasks de cada contenedor según el plan.
    pub placement: BTreeMap<ContainerId, Vec<TaskId>>,
    /// Rondas entregadas por task destino.
    pub rounds: BTreeMap<TaskId, usize>,
    pub syncs: BTreeMap<TaskId, usize>,
    /// Última entrega de cada destino.
    pub last: BTreeMap<TaskId, Delivery>,
    pub dropped: usize,
    pub elapsed: Duration,
}

/// Valor que manda la instancia `index` en la iteración `iteration`.
pub fn source_value(iteration: u32, index: usize) -> i64 {
    iteration as i64 * 100 + index as i64
}

fn build_spec(
    cfg: &JobConfig,
    comms_config: &CommsConfig,
    sources: &[TaskId],
    sinks: &[TaskId],
) -> OperationSpec {
    let spec = OperationSpec::new(
        cfg.operation,
        sources.iter().copied(),
        sinks.iter().copied(),
        DataType::Long,
    )
    .with_mode(cfg.mode)
    .with_fan_out(comms_config.fan_out);

    match cfg.operation {
        OperationKind::Reduce | OperationKind::AllReduce => spec.with_reducer(ReduceOp::Sum),
        OperationKind::KeyedReduce => spec
            .with_reducer(ReduceOp::Sum)
            .with_key_type(DataType::Integer),
        _ => spec,
    }
}

type Comms = BTreeMap<ContainerId, Communicator<LocalChannel>>;

/// Un tick de todos los contenedores.
fn pump(comms: &mut Comms) -> CommsResult<bool> {
    let mut did_work = false;
    for comm in comms.values_mut() {
        did_work |= comm.progress()?;
    }
    Ok(did_work)
}

/// Reintenta `send` progresando a todos mientras haya backpressure.
fn send_blocking(
    comms: &mut Comms,
    container: ContainerId,
    deadline: Instant,
    mut send: impl FnMut(&mut Communicator<LocalChannel>) -> CommsResult<bool>,
) -> Result<()> {
    loop {
        let comm = comms
            .get_mut(&container)
            .ok_or_else(|| anyhow!("contenedor {container} sin communicator"))?;
        if send(comm)? {
            return Ok(());
        }
        pump(comms)?;
        if Instant::now() >= deadline {
            bail!("backpressure sin liberar en el contenedor {container}");
        }
    }
}

fn feed(
    comms: &mut Comms,
    cfg: &JobConfig,
    edge: EdgeId,
    sources: &[(TaskId, ContainerId)],
    deadline: Instant,
) -> Result<()> {
    for iteration in 0..cfg.iterations {
        for (index, (task, container)) in sources.iter().enumerate() {
            let value = Value::Long(source_value(iteration, index));
            match cfg.operation {
                OperationKind::KeyedReduce => {
                    let key = Value::Integer((index % 4) as i32);
                    let pair = KeyValue::new(key, value);
                    send_blocking(comms, *container, deadline, |c| {
                        c.send_keyed(edge, *task, pair.clone())
                    })?;
                }
                _ => {
                    send_blocking(comms, *container, deadline, |c| {
                        c.send(edge, *task, value.clone())
                    })?;
                }
            }
        }
        debug!("iteración {} enviada", iteration);
    }

    for (task, container) in sources {
        comms
            .get_mut(container)
            .ok_or_else(|| anyhow!("contenedor {container} sin communicator"))?
            .finish(edge, *task)?;
    }
    Ok(())
}

/// Corre el job sobre un contenedor por worker de `workers`.
pub fn run_job(
    cfg: &JobConfig,
    workers: &WorkerPlan,
    comms_config: &CommsConfig,
) -> Result<JobReport> {
    let started = Instant::now();
    let deadline = started + cfg.deadline;

    /* =========================
       Plan de tasks
       ========================= */
    let vertices = vec![
        TaskVertex::new(SOURCE, cfg.sources),
        TaskVertex::new(SINK, cfg.sinks),
    ];
    let mut ids = IdAllocator::new();
    let plan = RoundRobinScheduler::new(SchedulerConfig::from_env())
        .schedule_batch(&vertices, workers, &mut ids)
        .context("scheduling del job")?;
    let plan = Arc::new(plan);

    let source_ids = plan.tasks_of(SOURCE);
    let sink_ids = plan.tasks_of(SINK);
    let op_plan = OperationBuilder::new()
        .plan(build_spec(cfg, comms_config, &source_ids, &sink_ids))
        .context("operación inválida")?;
    let edge = op_plan.edge();

    info!(
        "job {:?} ({:?}): {} sources, {} sinks, {} contenedores, fan-out {}, edge {}",
        cfg.operation,
        cfg.mode,
        source_ids.len(),
        sink_ids.len(),
        workers.len(),
        comms_config.fan_out,
        edge
    );

    /* =========================
       Un communicator por contenedor
       ========================= */
    let fabric = LocalFabric::new();
    let sink = CollectingSink::new();
    let mut comms: Comms = BTreeMap::new();
    for container in plan.containers() {
        let channel = fabric.channel(container.id, comms_config);
        let mut comm = Communicator::new(channel, plan.clone(), comms_config.clone())?;
        comm.register(&op_plan, Box::new(sink.clone()))?;
        comms.insert(container.id, comm);
    }

    let placed: Vec<(TaskId, ContainerId)> = source_ids
        .iter()
        .map(|t| {
            plan.container_of(*t)
                .map(|c| (*t, c))
                .ok_or_else(|| anyhow!("task {t} sin contenedor"))
        })
        .collect::<Result<_>>()?;

    feed(&mut comms, cfg, edge, &placed, deadline)?;

    /* =========================
       Progreso hasta terminar
       ========================= */
    while !comms.values().all(Communicator::all_complete) {
        let did_work = pump(&mut comms)?;
        if Instant::now() >= deadline {
            let dropped: usize = comms.values_mut().map(Communicator::close).sum();
            bail!(
                "el job no terminó en {:?} ({} mensajes incompletos)",
                cfg.deadline,
                dropped
            );
        }
        if !did_work {
            std::thread::yield_now();
        }
    }
    let dropped = comms.values_mut().map(Communicator::close).sum();

    let mut rounds = BTreeMap::new();
    let mut syncs = BTreeMap::new();
    let mut last = BTreeMap::new();
    for event in sink.events() {
        match event {
            SinkEvent::Round {
                destination,
                delivery,
            } => {
                *rounds.entry(destination).or_insert(0) += 1;
                last.insert(destination, delivery);
            }
            SinkEvent::Sync { destination } => {
                *syncs.entry(destination).or_insert(0) += 1;
            }
        }
    }

    let report = JobReport {
        operation: cfg.operation,
        containers: comms.len(),
        placement: plan.containers().map(|c| (c.id, plan.tasks_in(c.id))).collect(),
        rounds,
        syncs,
        last,
        dropped,
        elapsed: started.elapsed(),
    };
    info!(
        "job terminado en {:?}: rondas {:?}, syncs {:?}",
        report.elapsed, report.rounds, report.syncs
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{Resource, WorkerInfo, WorkerState};

    fn cfg(operation: OperationKind, sources: u32, sinks: u32, mode: Mode) -> JobConfig {
        JobConfig {
            operation,
            sources,
            sinks,
            iterations: 3,
            mode,
            deadline: Duration::from_secs(10),
        }
    }

    #[test]
    fn reduce_batch_suma_todas_las_iteraciones() {
        let report = run_job(
            &cfg(OperationKind::Reduce, 4, 1, Mode::Batch),
            &WorkerPlan::uniform(2),
            &CommsConfig::default(),
        )
        .unwrap();
        // sources 0..4, sink 4
        assert_eq!(report.rounds[&4], 1);
        assert_eq!(report.syncs[&4], 1);
        assert_eq!(report.last[&4], Delivery::Reduced(Value::Long(1218)));
        assert_eq!(report.dropped, 0);
    }

    #[test]
    fn allreduce_streaming_una_ronda_por_iteracion() {
        let mut c = cfg(OperationKind::AllReduce, 3, 2, Mode::Streaming);
        c.iterations = 2;
        let report = run_job(&c, &WorkerPlan::uniform(3), &CommsConfig::default()).unwrap();
        for sink in [3, 4] {
            assert_eq!(report.rounds[&sink], 2);
            assert_eq!(report.last[&sink], Delivery::Reduced(Value::Long(303)));
        }
    }

    #[test]
    fn gather_batch_junta_todo() {
        let report = run_job(
            &cfg(OperationKind::Gather, 3, 1, Mode::Batch),
            &WorkerPlan::uniform(2),
            &CommsConfig::default(),
        )
        .unwrap();
        match &report.last[&3] {
            Delivery::Gathered(items) => assert_eq!(items.len(), 9),
            other => panic!("entrega inesperada: {other:?}"),
        }
    }

    #[test]
    fn broadcast_con_dos_sources_es_invalido() {
        let err = run_job(
            &cfg(OperationKind::Broadcast, 2, 3, Mode::Streaming),
            &WorkerPlan::uniform(2),
            &CommsConfig::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("operación inválida"));
    }

    #[test]
    fn fan_out_de_la_config_llega_al_arbol() {
        let comms_config = CommsConfig {
            fan_out: 3,
            ..CommsConfig::default()
        };
        let report = run_job(
            &cfg(OperationKind::Reduce, 9, 1, Mode::Batch),
            &WorkerPlan::uniform(3),
            &comms_config,
        )
        .unwrap();
        // 3 iteraciones de 0..9: 9 * 300 + 36 * 3
        assert_eq!(report.last[&9], Delivery::Reduced(Value::Long(2808)));
        assert_eq!(
            build_spec(
                &cfg(OperationKind::Reduce, 9, 1, Mode::Batch),
                &comms_config,
                &[0, 1],
                &[2]
            )
            .fan_out,
            3
        );
    }

    #[test]
    fn plan_desde_los_workers_descubiertos() {
        let info = |id: u32, resource: Resource| WorkerInfo {
            id,
            host: format!("node-{id}"),
            port: 0,
            resource,
            state: WorkerState::Running,
            registered_at: chrono::Utc::now(),
            dead: false,
            last_heartbeat_secs_ago: 0,
        };
        // el worker 3 declara lugar para una sola instancia por defecto
        let instance = SchedulerConfig::from_env().instance;
        let workers = WorkerPlan::from_workers(&[
            info(3, instance),
            info(7, Resource::ZERO),
        ]);
        let report = run_job(
            &cfg(OperationKind::Reduce, 4, 1, Mode::Batch),
            &workers,
            &CommsConfig::default(),
        )
        .unwrap();
        assert_eq!(report.containers, 2);
        assert_eq!(report.last[&4], Delivery::Reduced(Value::Long(1218)));
        assert_eq!(report.placement[&3], vec![0]);
        assert_eq!(report.placement[&7], vec![1, 2, 3, 4]);
    }
}
