use eventide_core::Event;
use eventide_macros::event;

#[event(name = "user.registered")]
struct UserRegistered {
    user_id: String,
    email: String,
}

#[event(name = "heartbeat")]
struct Heartbeat;

#[event(name = "page.viewed")]
#[derive(PartialEq)]
struct PageViewed(String);

fn main() {
    assert_eq!(UserRegistered::NAME, "user.registered");
    assert_eq!(Heartbeat::NAME, "heartbeat");

    let ev = UserRegistered {
        user_id: "u-1".into(),
        email: "a@b.c".into(),
    };
    // Debug/Clone 由宏派生
    let _ = format!("{:?}", ev.clone());
    assert_eq!(ev.event_name().as_str(), "user.registered");

    // 已有 derive 与宏派生合并
    assert!(PageViewed("/".into()) == PageViewed("/".into()));
}
