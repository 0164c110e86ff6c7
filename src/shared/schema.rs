diesel::table! {
    organizations (id) {
        id -> Uuid,
        name -> Varchar,
        credits -> Numeric,
        allow_negative_credits -> Bool,
        credits_low_threshold -> Numeric,
        credits_low_notified_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    projects (id) {
        id -> Uuid,
        object_id -> Varchar,
        organization_id -> Uuid,
        name -> Varchar,
        api_token_hash -> Varchar,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    credentials (id) {
        id -> Uuid,
        project_id -> Uuid,
        provider -> Varchar,
        encrypted_data -> Text,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    bots (id) {
        id -> Uuid,
        object_id -> Varchar,
        project_id -> Uuid,
        session_type -> Varchar,
        meeting_url -> Text,
        name -> Varchar,
        state -> Varchar,
        sub_state -> Nullable<Varchar>,
        join_at -> Nullable<Timestamptz>,
        deduplication_key -> Nullable<Varchar>,
        settings -> Jsonb,
        metadata -> Jsonb,
        heartbeat_timestamp -> Nullable<Timestamptz>,
        first_heartbeat_timestamp -> Nullable<Timestamptz>,
        launch_attempts -> Int4,
        next_launch_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    bot_events (id) {
        id -> Uuid,
        object_id -> Varchar,
        bot_id -> Uuid,
        old_state -> Varchar,
        new_state -> Varchar,
        event_type -> Varchar,
        event_sub_type -> Nullable<Varchar>,
        metadata -> Jsonb,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    recordings (id) {
        id -> Uuid,
        object_id -> Varchar,
        bot_id -> Uuid,
        state -> Varchar,
        transcription_state -> Varchar,
        recording_type -> Varchar,
        participant_uuid -> Nullable<Varchar>,
        storage_key -> Nullable<Varchar>,
        bytes_uploaded -> Nullable<Int8>,
        duration_ms -> Nullable<Int8>,
        frames_dropped -> Int8,
        started_at -> Nullable<Timestamptz>,
        completed_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    participants (id) {
        id -> Uuid,
        bot_id -> Uuid,
        uuid -> Varchar,
        user_uuid -> Nullable<Varchar>,
        full_name -> Nullable<Varchar>,
        is_the_bot -> Bool,
        is_host -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    participant_events (id) {
        id -> Uuid,
        object_id -> Varchar,
        participant_id -> Uuid,
        event_type -> Varchar,
        event_data -> Jsonb,
        timestamp_ms -> Int8,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    utterances (id) {
        id -> Uuid,
        recording_id -> Uuid,
        participant_id -> Uuid,
        source -> Varchar,
        relative_timestamp_ms -> Int8,
        duration_ms -> Int8,
        transcript -> Nullable<Text>,
        words -> Nullable<Jsonb>,
        failure_data -> Nullable<Jsonb>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    chat_messages (id) {
        id -> Uuid,
        object_id -> Varchar,
        bot_id -> Uuid,
        participant_id -> Uuid,
        platform_message_id -> Nullable<Varchar>,
        text -> Text,
        timestamp_ms -> Int8,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    webhook_subscriptions (id) {
        id -> Uuid,
        object_id -> Varchar,
        project_id -> Uuid,
        url -> Text,
        triggers -> Jsonb,
        secret -> Varchar,
        is_active -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    webhook_delivery_attempts (id) {
        id -> Uuid,
        object_id -> Varchar,
        subscription_id -> Uuid,
        bot_id -> Nullable<Uuid>,
        trigger_type -> Varchar,
        idempotency_key -> Uuid,
        payload -> Jsonb,
        status -> Varchar,
        attempt_count -> Int4,
        last_attempt_at -> Nullable<Timestamptz>,
        next_attempt_at -> Nullable<Timestamptz>,
        response_body_list -> Jsonb,
        succeeded_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    debug_screenshots (id) {
        id -> Uuid,
        object_id -> Varchar,
        bot_id -> Uuid,
        storage_key -> Nullable<Varchar>,
        metadata -> Jsonb,
        created_at -> Timestamptz,
    }
}

diesel::joinable!(projects -> organizations (organization_id));
diesel::joinable!(credentials -> projects (project_id));
diesel::joinable!(bots -> projects (project_id));
diesel::joinable!(bot_events -> bots (bot_id));
diesel::joinable!(recordings -> bots (bot_id));
diesel::joinable!(participants -> bots (bot_id));
diesel::joinable!(participant_events -> participants (participant_id));
diesel::joinable!(utterances -> recordings (recording_id));
diesel::joinable!(utterances -> participants (participant_id));
diesel::joinable!(chat_messages -> bots (bot_id));
diesel::joinable!(chat_messages -> participants (participant_id));
diesel::joinable!(webhook_subscriptions -> projects (project_id));
diesel::joinable!(webhook_delivery_attempts -> webhook_subscriptions (subscription_id));
diesel::joinable!(debug_screenshots -> bots (bot_id));

diesel::allow_tables_to_appear_in_same_query!(
    organizations,
    projects,
    credentials,
    bots,
    bot_events,
    recordings,
    participants,
    participant_events,
    utterances,
    chat_messages,
    webhook_subscriptions,
    webhook_delivery_attempts,
    debug_screenshots,
);
