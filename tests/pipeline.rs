//! End-to-end pipeline tests: N ranks as N threads over the in-process
//! transport, writing through the in-memory backend.
//!
//! Every scenario runs the same call sequence on every rank, as a real
//! MPI application would; a rank that diverges deadlocks its peers, so
//! these tests double as collective-safety checks.

use smiol::backend::memory::MemStore;
use smiol::transport::{CommRef, LocalComm};
use smiol::{AttValue, Backend, Config, Context, FileMode, VarType};
use std::sync::Arc;
use std::thread;

/// Run one closure per rank on its own thread and collect the results.
fn run_ranks<T, F>(n: usize, f: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(CommRef, i32) -> T + Send + Sync + Clone + 'static,
{
    let comms = LocalComm::universe(n);
    let handles: Vec<_> = comms
        .into_iter()
        .enumerate()
        .map(|(rank, comm)| {
            let f = f.clone();
            thread::Builder::new()
                .name(format!("rank-{rank}"))
                .spawn(move || f(comm, rank as i32))
                .unwrap()
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

fn ctx_for(
    store: &MemStore,
    comm: CommRef,
    num_io_tasks: i32,
    io_stride: i32,
    config: Config,
) -> Arc<Context> {
    let config = Config {
        backend: Backend::Memory(store.clone()),
        ..config
    };
    Arc::new(Context::with_config(comm, num_io_tasks, io_stride, config).unwrap())
}

/// S1: single write through a single I/O rank, then a fresh open and a
/// decomposed read returning every rank's own elements.
#[test]
fn single_write_single_io_rank() {
    let store = MemStore::new();
    run_ranks(4, move |comm, rank| {
        let ctx = ctx_for(&store, comm, 1, 4, Config::default());
        let gids = [i64::from(rank) * 2, i64::from(rank) * 2 + 1];
        let decomp = ctx.create_decomp(&gids).unwrap();

        {
            let file = ctx.open_file("s1.nc", FileMode::CREATE).unwrap();
            file.define_dim("nCells", 8).unwrap();
            file.define_var("x", VarType::Real64, &["nCells"]).unwrap();
            let vals: Vec<f64> = gids.iter().map(|&g| g as f64).collect();
            file.put_var("x", Some(&decomp), &vals).unwrap();
            file.close().unwrap();
        }

        let file = ctx.open_file("s1.nc", FileMode::READ).unwrap();
        let mut back = [0.0f64; 2];
        file.get_var("x", Some(&decomp), &mut back).unwrap();
        assert_eq!(back, [gids[0] as f64, gids[1] as f64]);
        file.close().unwrap();
    });
}

/// S2: an unlimited record dimension; frames are addressed by
/// `set_frame` and do not bleed into each other.
#[test]
fn record_dimension_frames() {
    let store = MemStore::new();
    run_ranks(2, move |comm, rank| {
        let ctx = ctx_for(&store, comm, 2, 1, Config::default());
        let gids = [i64::from(rank) * 2, i64::from(rank) * 2 + 1];
        let decomp = ctx.create_decomp(&gids).unwrap();

        let file = ctx.open_file("s2.nc", FileMode::CREATE).unwrap();
        file.define_dim("time", -1).unwrap();
        file.define_dim("n", 4).unwrap();
        file.define_var("v", VarType::Real64, &["time", "n"]).unwrap();

        let frame0: Vec<f64> = gids.iter().map(|&g| g as f64).collect();
        let frame1: Vec<f64> = gids.iter().map(|&g| g as f64 + 10.0).collect();
        file.put_var("v", Some(&decomp), &frame0).unwrap();
        file.set_frame(1);
        file.put_var("v", Some(&decomp), &frame1).unwrap();
        file.sync().unwrap();

        let mut back = [0.0f64; 2];
        file.set_frame(0);
        file.get_var("v", Some(&decomp), &mut back).unwrap();
        assert_eq!(back.to_vec(), frame0);
        file.set_frame(1);
        file.get_var("v", Some(&decomp), &mut back).unwrap();
        assert_eq!(back.to_vec(), frame1);

        let time = file.inquire_dim("time").unwrap();
        assert!(time.is_unlimited);
        assert_eq!(time.size, 2);
        file.close().unwrap();
    });
}

/// S3: a non-decomposed zero-dimensional variable. One I/O rank's value
/// lands in the file (which one is unspecified) and a read broadcasts
/// the same value to every rank.
#[test]
fn non_decomposed_scalar() {
    let store = MemStore::new();
    let results = run_ranks(8, move |comm, rank| {
        let ctx = ctx_for(&store, comm, 4, 2, Config::default());
        let file = ctx.open_file("s3.nc", FileMode::CREATE).unwrap();
        file.define_var("y", VarType::Int32, &[]).unwrap();
        file.put_var("y", None, &[rank]).unwrap();
        file.sync().unwrap();

        let mut back = [0i32; 1];
        file.get_var("y", None, &mut back).unwrap();
        file.close().unwrap();
        back[0]
    });

    // every rank observes the same value, and it came from an I/O rank
    let first = results[0];
    assert!(results.iter().all(|&v| v == first));
    assert!(first % 2 == 0, "scalar came from non-I/O rank {first}");
}

/// S4: exceeding the attached-buffer budget forces collective flushes;
/// all values still round-trip and at least two wait-alls happen.
#[test]
fn buffer_overflow_triggers_wait_all() {
    let store = MemStore::new();
    let stats_store = store.clone();
    run_ranks(1, move |comm, _rank| {
        let config = Config {
            buf_size: 64 * 1024,
            ..Config::default()
        };
        let ctx = ctx_for(&store, comm, 1, 1, config);
        let n = 256usize; // 256 f32 = 1 KiB per frame
        let gids: Vec<i64> = (0..n as i64).collect();
        let decomp = ctx.create_decomp(&gids).unwrap();

        let file = ctx.open_file("s4.nc", FileMode::CREATE).unwrap();
        file.define_dim("time", -1).unwrap();
        file.define_dim("n", n as i64).unwrap();
        file.define_var("v", VarType::Real32, &["time", "n"]).unwrap();

        for frame in 0..300i64 {
            file.set_frame(frame);
            let vals: Vec<f32> = (0..n).map(|i| (frame * 1000 + i as i64) as f32).collect();
            file.put_var("v", Some(&decomp), &vals).unwrap();
        }
        file.sync().unwrap();

        for frame in (0..300i64).step_by(37) {
            file.set_frame(frame);
            let mut back = vec![0.0f32; n];
            file.get_var("v", Some(&decomp), &mut back).unwrap();
            let expect: Vec<f32> = (0..n).map(|i| (frame * 1000 + i as i64) as f32).collect();
            assert_eq!(back, expect, "frame {frame}");
        }
        file.close().unwrap();
    });

    let stats = stats_store.stats();
    assert_eq!(stats.bput_calls, 300);
    assert!(
        stats.wait_all_calls >= 2,
        "expected repeated flushes, saw {}",
        stats.wait_all_calls
    );
}

/// S5: metadata writes between data writes oscillate the define/data
/// state machine; the attribute and both writes all land.
#[test]
fn define_data_oscillation() {
    let store = MemStore::new();
    run_ranks(4, move |comm, rank| {
        let ctx = ctx_for(&store, comm, 2, 2, Config::default());
        let gids = [i64::from(rank) * 2, i64::from(rank) * 2 + 1];
        let decomp = ctx.create_decomp(&gids).unwrap();

        {
            let file = ctx.open_file("s5.nc", FileMode::CREATE).unwrap();
            file.define_dim("n", 8).unwrap();
            file.define_var("a", VarType::Int32, &["n"]).unwrap();
            file.define_var("b", VarType::Int32, &["n"]).unwrap();

            let vals: Vec<i32> = gids.iter().map(|&g| g as i32 * 3).collect();
            file.put_var("a", Some(&decomp), &vals).unwrap();

            // back into define mode mid-stream
            file.define_att(None, "title", &AttValue::Text("oscillation".into()))
                .unwrap();
            file.define_att(Some("a"), "scale", &AttValue::Real64(0.5))
                .unwrap();

            let vals: Vec<i32> = gids.iter().map(|&g| g as i32 * 7).collect();
            file.put_var("b", Some(&decomp), &vals).unwrap();
            file.close().unwrap();
        }

        let file = ctx.open_file("s5.nc", FileMode::READ).unwrap();
        assert_eq!(
            file.inquire_att(None, "title").unwrap(),
            AttValue::Text("oscillation".into())
        );
        assert_eq!(
            file.inquire_att(Some("a"), "scale").unwrap(),
            AttValue::Real64(0.5)
        );
        let mut back = [0i32; 2];
        file.get_var("a", Some(&decomp), &mut back).unwrap();
        assert_eq!(back, [gids[0] as i32 * 3, gids[1] as i32 * 3]);
        file.get_var("b", Some(&decomp), &mut back).unwrap();
        assert_eq!(back, [gids[0] as i32 * 7, gids[1] as i32 * 7]);
        file.close().unwrap();
    });
}

/// S6: a put on an undefined variable reports LIBRARY_ERROR and the
/// backend's own message is available through the context.
#[test]
fn error_latching() {
    let store = MemStore::new();
    run_ranks(2, move |comm, _rank| {
        let ctx = ctx_for(&store, comm, 2, 1, Config::default());
        let file = ctx.open_file("s6.nc", FileMode::CREATE).unwrap();
        file.define_dim("n", 2).unwrap();

        let err = file.put_var("nope", None, &[0.0f64]).unwrap_err();
        assert_eq!(err.code(), smiol::ErrorCode::LibraryError);
        assert_eq!(ctx.lib_error_string(), "Variable not found");
        file.close().unwrap();
    });
}

/// Changing the aggregation factor must not change file contents.
#[test]
fn aggregation_invariance() {
    for agg_factor in [0, 2, 4] {
        let store = MemStore::new();
        let check_store = store.clone();
        run_ranks(4, move |comm, rank| {
            let config = Config {
                agg_factor,
                ..Config::default()
            };
            let ctx = ctx_for(&store, comm, 2, 2, config);
            // scrambled ownership: rank r computes elements 7-2r, 6-2r
            let gids = [7 - i64::from(rank) * 2, 6 - i64::from(rank) * 2];
            let decomp = ctx.create_decomp(&gids).unwrap();

            let file = ctx.open_file("agg.nc", FileMode::CREATE).unwrap();
            file.define_dim("n", 8).unwrap();
            file.define_var("x", VarType::Real64, &["n"]).unwrap();
            let vals: Vec<f64> = gids.iter().map(|&g| 100.0 + g as f64).collect();
            file.put_var("x", Some(&decomp), &vals).unwrap();
            file.close().unwrap();
        });

        // read the file back whole on a fresh single-rank context
        let comm = LocalComm::universe(1).remove(0);
        let config = Config {
            backend: Backend::Memory(check_store),
            ..Config::default()
        };
        let ctx = Arc::new(Context::with_config(comm, 1, 1, config).unwrap());
        let file = ctx.open_file("agg.nc", FileMode::READ).unwrap();
        let mut all = [0.0f64; 8];
        file.get_var("x", None, &mut all).unwrap();
        let expect: Vec<f64> = (0..8).map(|g| 100.0 + g as f64).collect();
        assert_eq!(all.to_vec(), expect, "agg_factor {agg_factor}");
        file.close().unwrap();
    }
}

/// Collective safety: two I/O ranks, many queued writes per file with
/// identical call sequences; everything drains without deadlock.
#[test]
fn many_queued_writes_drain() {
    let store = MemStore::new();
    run_ranks(4, move |comm, rank| {
        let config = Config {
            buf_size: 16 * 1024,
            ..Config::default()
        };
        let ctx = ctx_for(&store, comm, 2, 2, config);
        let n = 64usize;
        let per = n / 4;
        let gids: Vec<i64> = (0..per).map(|i| (rank as usize * per + i) as i64).collect();
        let decomp = ctx.create_decomp(&gids).unwrap();

        let file = ctx.open_file("many.nc", FileMode::CREATE).unwrap();
        file.define_dim("time", -1).unwrap();
        file.define_dim("n", n as i64).unwrap();
        file.define_var("v", VarType::Int32, &["time", "n"]).unwrap();

        for frame in 0..50i64 {
            file.set_frame(frame);
            let vals: Vec<i32> = gids.iter().map(|&g| (frame * 100 + g) as i32).collect();
            file.put_var("v", Some(&decomp), &vals).unwrap();
        }
        // sync drains the writer, then more writes relaunch it
        file.sync().unwrap();
        for frame in 50..60i64 {
            file.set_frame(frame);
            let vals: Vec<i32> = gids.iter().map(|&g| (frame * 100 + g) as i32).collect();
            file.put_var("v", Some(&decomp), &vals).unwrap();
        }

        for frame in [0i64, 25, 49, 55, 59] {
            file.set_frame(frame);
            let mut back = vec![0i32; per];
            // get_var drains pending writes before reading
            file.get_var("v", Some(&decomp), &mut back).unwrap();
            let expect: Vec<i32> = gids.iter().map(|&g| (frame * 100 + g) as i32).collect();
            assert_eq!(back, expect, "rank {rank} frame {frame}");
        }
        file.close().unwrap();
    });
}

/// Wrong element type and short buffers are rejected before any data
/// moves.
#[test]
fn type_and_size_validation() {
    let store = MemStore::new();
    run_ranks(1, move |comm, _rank| {
        let ctx = ctx_for(&store, comm, 1, 1, Config::default());
        let decomp = ctx.create_decomp(&[0, 1, 2, 3]).unwrap();

        let file = ctx.open_file("val.nc", FileMode::CREATE).unwrap();
        file.define_dim("n", 4).unwrap();
        file.define_var("x", VarType::Real64, &["n"]).unwrap();

        let err = file
            .put_var("x", Some(&decomp), &[0i32, 1, 2, 3])
            .unwrap_err();
        assert_eq!(err.code(), smiol::ErrorCode::WrongArgType);

        let err = file.put_var("x", Some(&decomp), &[0.0f64; 2]).unwrap_err();
        assert_eq!(err.code(), smiol::ErrorCode::InsufficientArg);

        // a valid write still goes through afterwards
        file.put_var("x", Some(&decomp), &[0.0f64, 1.0, 2.0, 3.0])
            .unwrap();
        file.close().unwrap();
    });
}

/// Multi-dimensional decomposed variables: the decomposed axis is the
/// slowest non-record dimension and trailing dimensions ride along
/// inside each element.
#[test]
fn two_dimensional_elements() {
    let store = MemStore::new();
    run_ranks(2, move |comm, rank| {
        let ctx = ctx_for(&store, comm, 2, 1, Config::default());
        let gids = [i64::from(rank) * 2, i64::from(rank) * 2 + 1];
        let decomp = ctx.create_decomp(&gids).unwrap();

        let file = ctx.open_file("levels.nc", FileMode::CREATE).unwrap();
        file.define_dim("nCells", 4).unwrap();
        file.define_dim("nVertLevels", 3).unwrap();
        file.define_var("theta", VarType::Real64, &["nCells", "nVertLevels"])
            .unwrap();

        // element = 3 vertical levels per cell
        let mut vals = Vec::new();
        for &g in &gids {
            for level in 0..3 {
                vals.push(g as f64 * 10.0 + level as f64);
            }
        }
        file.put_var("theta", Some(&decomp), &vals).unwrap();
        file.sync().unwrap();

        let mut back = vec![0.0f64; 6];
        file.get_var("theta", Some(&decomp), &mut back).unwrap();
        assert_eq!(back, vals);

        let info = file.inquire_var("theta").unwrap();
        assert_eq!(info.vartype, VarType::Real64);
        assert_eq!(info.dims, vec!["nCells".to_string(), "nVertLevels".to_string()]);
        file.close().unwrap();
    });
}

/// Non-decomposed one-dimensional variables are written once (by rank
/// 0) and read back identically everywhere.
#[test]
fn non_decomposed_vector_round_trip() {
    let store = MemStore::new();
    run_ranks(4, move |comm, _rank| {
        let ctx = ctx_for(&store, comm, 2, 2, Config::default());
        let file = ctx.open_file("global.nc", FileMode::CREATE).unwrap();
        file.define_dim("n", 5).unwrap();
        file.define_var("lev", VarType::Real32, &["n"]).unwrap();

        // identical copies on every rank, per the non-decomposed contract
        let vals = [1.0f32, 2.0, 4.0, 8.0, 16.0];
        file.put_var("lev", None, &vals).unwrap();
        file.sync().unwrap();

        let mut back = [0.0f32; 5];
        file.get_var("lev", None, &mut back).unwrap();
        assert_eq!(back, vals);
        file.close().unwrap();
    });
}
