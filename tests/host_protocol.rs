use daybook_lib::host::{serve, Host};
use daybook_lib::service::CollectionService;
use serde_json::{json, Value};

fn open_host(dir: &tempfile::TempDir) -> Host {
    let service = CollectionService::open(&dir.path().join("daybook.sqlite")).expect("open service");
    Host::new(service)
}

async fn call(host: &Host, request: Value) -> Value {
    let response = host.handle_line(&request.to_string()).await;
    serde_json::to_value(response).expect("encode response")
}

async fn add_exercise(host: &Host, section: &str, name: &str) -> String {
    let response = call(
        host,
        json!({
            "id": name,
            "command": "add_item",
            "payload": {"collection": "exercises", "partition": section, "fields": {"name": name}}
        }),
    )
    .await;
    assert_eq!(response["ok"], json!(true), "{response}");
    response["result"]["id"].as_str().expect("item id").to_string()
}

fn names(listing: &Value) -> Vec<String> {
    listing["result"]["items"]
        .as_array()
        .expect("items")
        .iter()
        .map(|item| item["fields"]["name"].as_str().expect("name").to_string())
        .collect()
}

#[tokio::test]
async fn reorder_round_trip_over_the_wire() {
    let dir = tempfile::tempdir().expect("tempdir");
    let host = open_host(&dir);

    let squat = add_exercise(&host, "Strength", "squat").await;
    let lunge = add_exercise(&host, "Strength", "lunge").await;
    let row = add_exercise(&host, "Strength", "row").await;
    add_exercise(&host, "Cardio", "run").await;

    let listing = call(
        &host,
        json!({"id": 1, "command": "list_items", "payload": {"collection": "exercises", "partition": "Strength"}}),
    )
    .await;
    assert_eq!(names(&listing), vec!["squat", "lunge", "row"]);
    let revision = listing["result"]["revision"].as_i64().expect("revision");

    let reorder = call(
        &host,
        json!({
            "id": 2,
            "command": "replace_order",
            "payload": {
                "collection": "exercises",
                "partition": "Strength",
                "orderedIds": [squat, row, lunge],
                "expectedRevision": revision
            }
        }),
    )
    .await;
    assert_eq!(reorder["ok"], json!(true), "{reorder}");
    assert_eq!(reorder["id"], json!(2));
    assert_eq!(reorder["result"]["revision"], json!(revision + 1));

    let listing = call(
        &host,
        json!({"id": 3, "command": "list_items", "payload": {"collection": "exercises", "partition": "Strength"}}),
    )
    .await;
    assert_eq!(names(&listing), vec!["squat", "row", "lunge"]);

    let cardio = call(
        &host,
        json!({"id": 4, "command": "list_items", "payload": {"collection": "exercises", "partition": "Cardio"}}),
    )
    .await;
    assert_eq!(names(&cardio), vec!["run"]);

    host.into_service().shutdown().expect("shutdown");
}

#[tokio::test]
async fn stale_revision_is_reported_as_conflict() {
    let dir = tempfile::tempdir().expect("tempdir");
    let host = open_host(&dir);

    let first = add_exercise(&host, "Mobility", "hip circles").await;
    let second = add_exercise(&host, "Mobility", "cat cow").await;

    let response = call(
        &host,
        json!({
            "id": "stale",
            "command": "replace_order",
            "payload": {
                "collection": "exercises",
                "partition": "Mobility",
                "orderedIds": [first, second],
                "expectedRevision": 1
            }
        }),
    )
    .await;
    assert_eq!(response["ok"], json!(false));
    assert_eq!(response["id"], json!("stale"));
    assert_eq!(response["error"]["code"], json!("CONFLICT"));
    assert!(response.get("result").is_none());
}

#[tokio::test]
async fn validation_and_not_found_codes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let host = open_host(&dir);

    let missing_name = call(
        &host,
        json!({
            "id": 1,
            "command": "add_item",
            "payload": {"collection": "projects", "fields": {"name": "   "}}
        }),
    )
    .await;
    assert_eq!(missing_name["error"]["code"], json!("VALIDATION"));

    let remove = call(
        &host,
        json!({"id": 2, "command": "remove_item", "payload": {"collection": "projects", "id": "nope"}}),
    )
    .await;
    assert_eq!(remove["error"]["code"], json!("NOT_FOUND"));
}

#[tokio::test]
async fn settings_are_merged_through_the_host() {
    let dir = tempfile::tempdir().expect("tempdir");
    let host = open_host(&dir);

    let updated = call(
        &host,
        json!({"id": 1, "command": "update_settings", "payload": {"requireOrderRevision": true}}),
    )
    .await;
    assert_eq!(updated["ok"], json!(true), "{updated}");
    assert_eq!(updated["result"]["requireOrderRevision"], json!(true));
    assert_eq!(updated["result"]["busyTimeoutMs"], json!(5000));

    let item = add_exercise(&host, "Core", "plank").await;
    let unguarded = call(
        &host,
        json!({
            "id": 2,
            "command": "replace_order",
            "payload": {"collection": "exercises", "partition": "Core", "orderedIds": [item]}
        }),
    )
    .await;
    assert_eq!(unguarded["error"]["code"], json!("VALIDATION"));
}

#[tokio::test]
async fn serve_answers_each_line_in_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let host = open_host(&dir);

    let input = concat!(
        "{\"id\":1,\"command\":\"get_settings\"}\n",
        "\n",
        "garbage\n",
        "{\"id\":3,\"command\":\"list_items\",\"payload\":{\"collection\":\"subjects\"}}\n",
    );
    let mut output = Vec::new();
    let handled = serve(&host, input.as_bytes(), &mut output).await.expect("serve");
    assert_eq!(handled, 3);

    let responses: Vec<Value> = String::from_utf8(output)
        .expect("utf8")
        .lines()
        .map(|line| serde_json::from_str(line).expect("response json"))
        .collect();
    assert_eq!(responses.len(), 3);
    assert_eq!(responses[0]["id"], json!(1));
    assert_eq!(responses[0]["result"]["trimFieldValues"], json!(true));
    assert_eq!(responses[1]["id"], Value::Null);
    assert_eq!(responses[1]["error"]["code"], json!("VALIDATION"));
    assert_eq!(responses[2]["result"]["items"], json!([]));
    assert_eq!(responses[2]["result"]["revision"], json!(0));
}
