/*!

This is the long-form manual for `station_votes` and `stvotes`.

## Overview

Every electoral cycle (an *epoch*) publishes two tables: the results by polling
station and a directory of the polling stations with their address. Both change
layout, header language, code precision and sentinel values from one epoch to the
next. `stvotes` turns them into one table of votes per station, bloc and party,
located by latitude and longitude:

1. the results table is read and each row is normalized into canonical codes;
2. votes are summed per (epoch, locality, station, bloc, party);
3. the station directory is read and each station gets a full address;
4. addresses missing from the geocode store are sent to the geocoding provider;
5. votes are joined to stations, then stations to coordinates.

Nothing is dropped silently: rows that fail a join end up in the unmatched report and
every stage is counted in the run summary.

## The registry

The registry is a JSON file describing every epoch. Paths are relative to the
registry file.

```json
{
  "blocsFile": "Blocs.tsv",
  "epochs": [
    {
      "epoch": 17,
      "results": {
        "path": "17/results_17.xls",
        "sheet": "kalfiyot",
        "headerRow": 0,
        "locality": "סמל ישוב",
        "station": "מספר קלפי"
      },
      "sentinel": 0,
      "directory": {
        "path": "17/results_17.xls",
        "sheet": "kalfiyot",
        "skipRows": 150,
        "locality": 0,
        "station": 1,
        "localityName": 2,
        "addressName": 3,
        "stationScale": 0.1
      }
    },
    { "epoch": 16, "results": { "...": "..." }, "directoryFrom": 17 }
  ]
}
```

### Tables

| key | meaning |
|-----|---------|
| `path` | the file. `.xls`, `.xlsx`, `.xlsb` and `.ods` are read as workbooks, `.csv` and `.tsv` as delimited text |
| `sheet` | the worksheet. Defaults to the first one |
| `headerRow` | 0-based row holding the column labels. Data starts on the next row |
| `skipRows` | data rows to skip before reading |
| `localityScale`, `stationScale` | unit corrections for the codes: a whole multiplier (`10`) or the inverse of a whole divisor (`0.1`) |

### Columns

Columns are given either by 0-based position (a JSON number) or by header label (a
JSON string, which requires `headerRow`). Labels are compared after trimming.

The results table needs `locality`, `station` and the vote columns. Vote columns are
listed inline under `voteColumns` as `{"column": ..., "bloc": ..., "party": ...}`, or
in the bloc file: a tab-separated file with the columns `Epoch`, `Bloc`, `Column` and
optionally `Party`, one row per party and epoch.

The directory table needs `locality`, `station`, `localityName` and `addressName`.

### Sentinels

`sentinel` is the locality code of military and other non-geographic stations. Rows
with this locality are dropped before aggregation. It is optional.

### Shared directories

Some epochs did not publish a directory. `directoryFrom` makes an epoch use the
directory of another one. The scale factors of both tables must put the codes in the
same unit: a high rate of station misses in the summary usually means they do not.

## Addresses

The full address of a station is `"<address name>, <locality name>"`. It is sent as
is to the provider, and joined on its canonical form: commas become spaces, numbers
are separated from the surrounding text, repeated spaces collapse and the ends are
trimmed. See [`crate::address::canonicalize`].

## Outputs

All outputs are tab-separated, one file per epoch:

* `combined/<epoch>.tsv`: `epoch`, `locality_code`, `station_code`, `latitude`,
  `longitude`, `bloc`, `party`, `votes`
* `unmatched/<epoch>.tsv`: the rows dropped at the station or geocode join
* `elections/<epoch>.tsv`: the aggregated votes
* `stations/<epoch>.tsv`: the station directory used by the epoch

The geocode store (`locations.tsv` by default) holds `Address`, `Latitude`,
`Longitude`. It is only ever appended to, one line per resolved address, so an
interrupted run loses nothing. Addresses without a candidate are not stored and are
retried on the next run.

`summary.json` holds the counts of every stage for every epoch.

*/
