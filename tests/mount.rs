use std::sync::{Arc, Mutex};
use std::time::Duration;

use weft::middleware::{BoxedMiddleware, Next, boxed};
use weft::mount::{Host, MountParams, client_main, start};
use weft::view::text;
use weft::{Context, DataStream, Error, Redirect, Route, RouteRef, ViewNode, app};

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Title(String),
    Push(String, String),
    Replace(String, String),
    Render(String),
}

#[derive(Default)]
struct Recorder(Mutex<Vec<Event>>);

impl Recorder {
    fn events(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }

    fn last_render(&self) -> Option<String> {
        self.events().into_iter().rev().find_map(|e| match e {
            Event::Render(html) => Some(html),
            _ => None,
        })
    }

    fn locations(&self) -> Vec<Event> {
        self.events().into_iter().filter(|e| matches!(e, Event::Push(..) | Event::Replace(..))).collect()
    }
}

impl Host for Recorder {
    fn set_title(&self, title: &str) {
        self.0.lock().unwrap().push(Event::Title(title.to_owned()));
    }

    fn push_location(&self, title: &str, url: &str) {
        self.0.lock().unwrap().push(Event::Push(title.to_owned(), url.to_owned()));
    }

    fn replace_location(&self, title: &str, url: &str) {
        self.0.lock().unwrap().push(Event::Replace(title.to_owned(), url.to_owned()));
    }

    fn render(&self, content: ViewNode) {
        self.0.lock().unwrap().push(Event::Render(content.to_html()));
    }
}

fn delay(ms: u64) -> BoxedMiddleware {
    boxed(move |ctx: Context, next: Next| async move {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        next.run(ctx).await
    })
}

fn redirect_to(target: Route) -> BoxedMiddleware {
    boxed(move |_: Context, _: Next| {
        let to = target.transition();
        async move { Ok(Redirect::to(to).into()) }
    })
}

fn mount_params(routes: Vec<RouteRef>, path: &str) -> (MountParams, Arc<Recorder>) {
    let host = Arc::new(Recorder::default());
    (MountParams::new(routes, path, Arc::clone(&host) as Arc<dyn Host>), host)
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn initial_render_shows_title_and_body() {
    let home = app("").subroute("/").title("Home").render("welcome");
    let (params, host) = mount_params(vec![home.into()], "/");
    start(params).await.unwrap();
    assert_eq!(host.events(), vec![Event::Render("welcome".into()), Event::Title("Home".into())]);
}

#[tokio::test]
async fn body_updates_reach_the_host() {
    let (sink, body) = DataStream::channel();
    sink.next(text("1"));
    let page = app("").subroute("/").render(body);
    let (params, host) = mount_params(vec![page.into()], "/");
    let _client = start(params).await.unwrap();
    assert_eq!(host.last_render().as_deref(), Some("1"));

    sink.next(text("2"));
    assert_eq!(host.last_render().as_deref(), Some("2"));
}

#[tokio::test]
async fn recursive_initial_redirect_is_rejected() {
    let root = app("");
    let x = root.subroute("/x");
    let looping = x.middleware(redirect_to(x.clone()));
    let (params, _) = mount_params(vec![looping.into()], "/x");
    match start(params).await {
        Err(Error::RecursiveRedirect { from, to }) => assert_eq!((from.as_str(), to.as_str()), ("/x", "/x")),
        other => panic!("expected a recursive redirect, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn initial_redirects_are_followed() {
    let root = app("");
    let target = root.subroute("/new").render("new page");
    let old = root.subroute("/old").middleware(redirect_to(target.clone()));
    let (params, host) = mount_params(vec![old.into(), target.into()], "/old");
    start(params).await.unwrap();
    assert_eq!(host.last_render().as_deref(), Some("new page"));
}

#[tokio::test]
async fn newer_transition_wins_the_race() {
    let root = app("");
    let home = root.subroute("/").render("home");
    let slow = root.subroute("/slow").middleware(delay(100)).title("Slow").render("slow");
    let fast = root.subroute("/fast").middleware(delay(10)).title("Fast").render("fast");
    let (params, host) = mount_params(vec![home.into(), slow.clone().into(), fast.clone().into()], "/");
    let client = start(params).await.unwrap();

    let a = client.perform_transition(slow.transition(), false);
    let b = client.perform_transition(fast.transition(), false);
    let (a, b) = tokio::join!(a, b);
    a.unwrap();
    b.unwrap();

    assert_eq!(host.last_render().as_deref(), Some("fast"));
    assert_eq!(host.locations(), vec![Event::Push("Fast".into(), "/fast".into())]);
    assert!(!host.events().contains(&Event::Render("slow".into())));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn latest_request_stays_on_screen() {
    let root = app("");
    let home = root.subroute("/").render("home");
    let a = root.subroute("/a").middleware(delay(2)).title("A").render("a");
    let b = root.subroute("/b").middleware(delay(1)).title("B").render("b");
    let (params, host) = mount_params(vec![home.into(), a.clone().into(), b.clone().into()], "/");
    let client = start(params).await.unwrap();

    let mut running = Vec::new();
    for i in 0..50 {
        let target = if i % 2 == 0 { a.transition() } else { b.transition() };
        running.push(tokio::spawn(client.perform_transition(target, false)));
        tokio::task::yield_now().await;
    }
    for task in running {
        task.await.unwrap().unwrap();
    }

    assert_eq!(host.last_render().as_deref(), Some("b"));
    assert_eq!(host.locations().last(), Some(&Event::Push("B".into(), "/b".into())));
}

#[tokio::test]
async fn redirects_replace_the_location() {
    let root = app("");
    let home = root.subroute("/").render("home");
    let target = root.subroute("/new").title("New").render("new page");
    let old = root.subroute("/old").middleware(redirect_to(target.clone()));
    let (params, host) = mount_params(vec![home.into(), old.clone().into(), target.into()], "/");
    let client = start(params).await.unwrap();

    client.perform_transition(old.transition(), false).await.unwrap();
    assert_eq!(host.locations(), vec![Event::Replace("New".into(), "/new".into())]);
}

#[tokio::test]
async fn bus_requests_navigate() {
    let root = app("");
    let home = root.subroute("/").render("home");
    let about = root.subroute("/about").title("About").render("about us");
    let (params, host) = mount_params(vec![home.into(), about.into()], "/");
    let bus = params.bus.clone();
    let _client = start(params).await.unwrap();

    bus.request_path("/about");
    eventually(|| !host.locations().is_empty()).await;
    assert_eq!(host.locations(), vec![Event::Push("About".into(), "/about".into())]);
    assert_eq!(host.last_render().as_deref(), Some("about us"));
}

#[tokio::test]
async fn unmount_stops_following_navigation() {
    let root = app("");
    let home = root.subroute("/").render("home");
    let about = root.subroute("/about").render("about us");
    let (params, host) = mount_params(vec![home.into(), about.into()], "/");
    let bus = params.bus.clone();
    let client = start(params).await.unwrap();

    client.unmount();
    bus.request_path("/about");
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(host.locations().is_empty());
}

#[tokio::test]
async fn development_mount_failures_render_the_error() {
    let page = app("").subroute("/").title("no body");
    let (params, host) = mount_params(vec![page.into()], "/");
    assert!(matches!(client_main(params).await, Err(Error::MissingBody(_))));
    assert!(host.last_render().unwrap().contains("no body declared on route /"));
}
