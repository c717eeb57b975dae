use std::num::NonZeroUsize;

use parameter_server::{AddDelta, NoBlockingSync, ParameterHandle, ParameterStore};
use tokio::task::JoinSet;

const PARAMS: usize = 7;
const RANKS: usize = 4;
const PUSHES: usize = 25;

fn create_handle() -> ParameterHandle<AddDelta> {
    let shard_size = NonZeroUsize::new(3).unwrap();
    let store = ParameterStore::new(shard_size, &[0.0; PARAMS], |_| AddDelta::default());
    ParameterHandle::new(store)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn wait_all_makes_every_push_visible() {
    let handle = create_handle();
    let sync = NoBlockingSync::new(RANKS);
    let mut tasks = JoinSet::new();

    for rank in 0..RANKS {
        let handle = handle.clone();
        let sync = sync.clone();

        tasks.spawn(async move {
            let mut params = [0.0; PARAMS];
            let delta = [(rank + 1) as f32; PARAMS];

            for _ in 0..PUSHES {
                sync.step(&handle, &delta, &mut params).await.unwrap();
            }

            sync.wait_all(&handle).await;
            handle.pull_params(&mut params).await.unwrap();
            params
        });
    }

    // 25 * (1 + 2 + 3 + 4)
    let expected = (PUSHES * (1..=RANKS).sum::<usize>()) as f32;
    while let Some(res) = tasks.join_next().await {
        assert_eq!(res.unwrap(), [expected; PARAMS]);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn step_pulls_the_latest_parameters() {
    let handle = create_handle();
    let sync = NoBlockingSync::new(1);

    let mut params = [0.0; PARAMS];
    sync.step(&handle, &[0.5; PARAMS], &mut params).await.unwrap();
    assert_eq!(params, [0.5; PARAMS]);

    let err = sync.step(&handle, &[0.5; 2], &mut params).await.unwrap_err();
    assert_eq!(err.expected, PARAMS);
}

#[tokio::test(flavor = "multi_thread")]
async fn flush_applies_what_was_only_accumulated() {
    let handle = create_handle();
    let mut params = [0.0; PARAMS];

    handle.push(&[1.0; PARAMS]).await.unwrap();
    handle.accumulate(&[2.0; PARAMS]).await.unwrap();
    handle.pull_params(&mut params).await.unwrap();
    assert_eq!(params, [1.0; PARAMS]);

    handle.flush().await;
    handle.pull_params(&mut params).await.unwrap();
    assert_eq!(params, [3.0; PARAMS]);
    assert_eq!(handle.len(), PARAMS);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_push_is_visible_once_it_returns() {
    let handle = create_handle();
    let mut tasks = JoinSet::new();

    for rank in 0..RANKS {
        let handle = handle.clone();

        tasks.spawn(async move {
            let delta = [1.0; PARAMS];
            let mut params = [0.0; PARAMS];

            for i in 0..PUSHES {
                let before = handle.updates();
                handle.push(&delta).await.unwrap();
                handle.pull_params(&mut params).await.unwrap();
                assert!(handle.updates() > before, "rank {rank} push {i}");
                assert!(params[0] >= (i + 1) as f32);
            }
        });
    }

    tasks.join_all().await;

    let mut params = [0.0; PARAMS];
    handle.pull_params(&mut params).await.unwrap();
    assert_eq!(params, [(RANKS * PUSHES) as f32; PARAMS]);
}
