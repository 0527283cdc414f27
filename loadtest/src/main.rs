use goose::prelude::*;
use rand::Rng;

/// Load testing suite for the image server.
///
/// Simulates production traffic against `/images/:image`:
/// - Fixed dimensions (cache hit scenarios after warmup)
/// - Random dimensions (cache miss scenarios, transcoder throughput)
/// - Different `Accept` headers (one derivative per negotiated format)
/// - Health monitoring endpoint
///
/// The target server needs an original named `cat` (or set `LOADTEST_IMAGE`).
///
/// # Usage
/// ```bash
/// cd loadtest
/// cargo run --release -- --host http://localhost:3000 --users 10 --hatch-rate 2 --run-time 60s
/// ```
#[tokio::main]
async fn main() -> Result<(), GooseError> {
    GooseAttack::initialize()?
        .register_scenario(
            scenario!("Derivatives")
                .register_transaction(transaction!(random_size).set_weight(5)?)
                .register_transaction(transaction!(negotiated_formats).set_weight(3)?)
                .register_transaction(transaction!(health_check).set_weight(1)?)
        )
        .register_scenario(
            scenario!("CachePerformance")
                // Consistent parameters validate cache hit performance
                .register_transaction(transaction!(cached_image).set_weight(15)?)
        )
        .execute()
        .await?;

    Ok(())
}

fn image_name() -> String {
    std::env::var("LOADTEST_IMAGE").unwrap_or_else(|_| "cat".to_string())
}

async fn get_with_accept(user: &mut GooseUser, path: &str, accept: &str) -> TransactionResult {
    let builder = user
        .get_request_builder(&GooseMethod::Get, path)?
        .header("Accept", accept);
    let request = GooseRequest::builder().set_request_builder(builder).build();
    let _goose = user.request(request).await?;
    Ok(())
}

/// Requests a random size, mostly cache misses until the key space fills.
async fn random_size(user: &mut GooseUser) -> TransactionResult {
    // Generate random parameters before await to satisfy Send bounds
    let path = {
        let mut rng = rand::thread_rng();
        let width = rng.gen_range(50..1200);
        let height = rng.gen_range(50..1200);
        format!("/images/{}?w={}&h={}", image_name(), width, height)
    };

    get_with_accept(user, &path, "image/webp,image/*;q=0.8").await
}

/// Same size, different client capabilities.
async fn negotiated_formats(user: &mut GooseUser) -> TransactionResult {
    let accept = {
        let mut rng = rand::thread_rng();
        let accepts = ["image/avif,image/webp", "image/webp", "image/jpeg", "image/png"];
        accepts[rng.gen_range(0..accepts.len())]
    };
    let path = format!("/images/{}?w=320", image_name());

    get_with_accept(user, &path, accept).await
}

/// Fixed parameters guarantee cache hits after the first request.
async fn cached_image(user: &mut GooseUser) -> TransactionResult {
    let path = format!("/images/{}?w=500&h=500", image_name());
    get_with_accept(user, &path, "image/webp").await
}

/// Baseline for infrastructure latency separate from image work.
async fn health_check(user: &mut GooseUser) -> TransactionResult {
    let _goose = user.get("/health").await?;
    Ok(())
}
