use std::convert::Infallible;

use futures_util::StreamExt;
use latest_stage::PipelineStage;

#[tokio::main]
async fn main() {
    // A pipeline that squares whatever it is handed on its own thread.
    let mut stage = PipelineStage::new(|x: u64| Ok::<_, Infallible>(x * x));
    stage.start().unwrap();
    // A reader can be turned into a stream of outputs.
    let stream = stage.reader().into_stream();
    let watching_task = tokio::task::spawn(watching_task(stream));

    // Hand over a sequence of inputs. Inputs the worker hasn't picked up yet
    // are replaced by newer ones.
    for i in 1..=1000 {
        stage.publish_input(i);
        tokio::task::yield_now().await;
    }

    // Wait until the last input has been transformed, then stop the worker.
    // Stopping ends the stream once the final output has been read.
    while stage.is_input_pending() || stage.is_updating() {
        tokio::task::yield_now().await;
    }
    stage.shutdown().unwrap();

    watching_task.await.unwrap();
}

async fn watching_task(mut stream: latest_stage::SlotStream<u64>) {
    while let Some(value) = stream.next().await {
        // The outputs we receive will not necessarily be sequential.
        println!("Read value: {value}");
    }
}

#[test]
fn runs() {
    main()
}
