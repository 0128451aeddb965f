//! Media iteration detection over real store history

use std::sync::Arc;

use quill_config::MediaConfig;
use quill_context::{HistoryContext, MediaContext, MediaOutput, MediaRequest};
use quill_store::MessageStore;
use quill_types::{MediaItem, NewMessage};

use crate::common::{open_store, session};

async fn cat_session(store: &Arc<MessageStore>) -> quill_types::Message {
    let s1 = session("s1");
    store.write(NewMessage::user(s1.clone(), "draw a cat")).unwrap();
    let m1 = store
        .write(
            NewMessage::assistant(s1.clone(), "Here you go").with_media(vec![
                MediaItem::image("https://img/cat.png").with_prompt("a cat on a sofa"),
            ]),
        )
        .unwrap();
    // Half the history persisted, half buffered.
    store.flush(Some(&s1)).await.unwrap();
    store
        .write(NewMessage::user(s1.clone(), "nice, thanks"))
        .unwrap();
    m1
}

#[tokio::test]
async fn follow_up_edit_is_an_iteration() {
    let store = open_store().await;
    let m1 = cat_session(&store).await;
    let media = MediaContext::new(MediaConfig::default()).with_history(store.clone());

    let context = media
        .build(&MediaRequest::new(session("s1"), "make it blue", MediaOutput::Image))
        .await;

    let Some(HistoryContext::Iteration { chain, last_media, .. }) = context.history else {
        panic!("expected an iteration");
    };
    assert!(chain.contains(&m1.id));
    assert_eq!(last_media.as_ref(), m1.media.first());
}

#[tokio::test]
async fn unrelated_request_attaches_nothing() {
    let store = open_store().await;
    cat_session(&store).await;
    let media = MediaContext::new(MediaConfig::default()).with_history(store.clone());

    let context = media
        .build(&MediaRequest::new(session("s1"), "draw a dog", MediaOutput::Image))
        .await;

    assert!(context.history.is_none());
}

#[tokio::test]
async fn other_sessions_do_not_leak_in() {
    let store = open_store().await;
    cat_session(&store).await;
    let media = MediaContext::new(MediaConfig::default()).with_history(store.clone());

    let context = media
        .build(&MediaRequest::new(session("s2"), "make it blue", MediaOutput::Video))
        .await;

    assert!(context.history.is_none());
}
